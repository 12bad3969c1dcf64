//! Programming a profile into the radio.

use crate::config::RfConfig;
use crate::error::TransportError;
use crate::profile::{ProfileDescriptor, RadioMode};
use crate::transport::{FskParams, RadioSetting, RadioTransport};
use std::time::Duration;
use tracing::debug;

/// Lowest bit rate accepted by the combined FSK initialisation, bit/s
pub const MIN_FSK_BITRATE: u32 = 4800;

/// Settle time after standby before reprogramming for FSK
pub const FSK_SETTLE: Duration = Duration::from_millis(400);

/// Put the radio in standby and apply every parameter of `profile`.
///
/// Stops at the first failing command. The caller owns the radio lock and
/// decides what to do with the partially programmed radio.
pub async fn configure(
    radio: &mut dyn RadioTransport,
    profile: &ProfileDescriptor,
    rf: &RfConfig,
) -> Result<(), TransportError> {
    radio.standby().await?;

    match profile.mode {
        RadioMode::LoRa => {
            let settings = [
                RadioSetting::Modem(RadioMode::LoRa),
                RadioSetting::Frequency(rf.frequency_mhz),
                RadioSetting::SpreadingFactor(profile.spreading_factor),
                RadioSetting::CodingRate(profile.coding_rate),
                RadioSetting::Bandwidth(profile.bandwidth_khz),
                RadioSetting::PreambleLength(rf.preamble_len),
                RadioSetting::Crc(true),
                RadioSetting::OutputPower(rf.tx_power_dbm),
                RadioSetting::SyncWord(rf.sync_word),
            ];
            for setting in settings {
                radio.apply(setting).await?;
            }
        }
        RadioMode::Fsk => {
            tokio::time::sleep(FSK_SETTLE).await;
            radio.apply(RadioSetting::Modem(RadioMode::Fsk)).await?;
            radio.apply(RadioSetting::Frequency(rf.frequency_mhz)).await?;

            let bitrate_kbps = profile.bitrate as f32 / 1000.0;
            let deviation_khz = profile.deviation as f32 / 1000.0;
            match radio.apply(RadioSetting::BitRate(bitrate_kbps)).await {
                Ok(()) => {
                    radio
                        .apply(RadioSetting::FrequencyDeviation(deviation_khz))
                        .await?;
                    radio
                        .apply(RadioSetting::RxBandwidth(profile.bandwidth_khz))
                        .await?;
                }
                Err(e) => {
                    debug!("Bit rate not settable ({}), falling back to FSK init", e);
                    if profile.bitrate < MIN_FSK_BITRATE {
                        return Err(TransportError::Unsupported("bit rate below 4800 b/s"));
                    }
                    radio
                        .begin_fsk(FskParams {
                            bitrate_kbps,
                            deviation_khz,
                            rx_bandwidth_khz: profile.bandwidth_khz,
                        })
                        .await?;
                }
            }
            radio.apply(RadioSetting::Crc(true)).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackAir;
    use crate::profile::PROFILES;

    #[tokio::test(start_paused = true)]
    async fn test_lora_profile_applies() {
        let air = LoopbackAir::new();
        let mut radio = air.radio();
        configure(&mut radio, &PROFILES[0], &RfConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lora_failure_stops() {
        let air = LoopbackAir::new();
        let mut radio = air.radio();
        radio.handle().fail_setting(Some("sync_word"));
        let err = configure(&mut radio, &PROFILES[4], &RfConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Command {
                setting: "sync_word",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fsk_fallback() {
        let air = LoopbackAir::new();
        let mut radio = air.radio();
        let handle = radio.handle();
        handle.set_bitrate_unsupported(true);
        configure(&mut radio, &PROFILES[10], &RfConfig::default())
            .await
            .unwrap();

        handle.fail_setting(Some("begin_fsk"));
        assert!(configure(&mut radio, &PROFILES[10], &RfConfig::default())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fsk_fallback_minimum_bitrate() {
        let air = LoopbackAir::new();
        let mut radio = air.radio();
        radio.handle().set_bitrate_unsupported(true);
        let slow = ProfileDescriptor {
            bitrate: 2400,
            ..PROFILES[9]
        };
        assert!(matches!(
            configure(&mut radio, &slow, &RfConfig::default()).await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
