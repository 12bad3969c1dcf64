//! In-memory shared medium for tests and simulations.
//!
//! Every [`LoopbackRadio`] attached to the same [`LoopbackAir`] hears the
//! frames the others transmit, but only while it is in receive mode and
//! tuned to the same modulation as the sender.

use crate::error::TransportError;
use crate::profile::RadioMode;
use crate::transport::{FskParams, RadioSetting, RadioTransport, ReceivedPacket};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Tuning {
    mode: Option<RadioMode>,
    spreading_factor: u8,
    coding_rate: u8,
    bandwidth_khz: f32,
    bitrate_kbps: f32,
    deviation_khz: f32,
}

impl Tuning {
    fn channel(&self) -> Option<(RadioMode, u32, u32, u32)> {
        match self.mode? {
            RadioMode::LoRa => Some((
                RadioMode::LoRa,
                self.spreading_factor as u32,
                self.coding_rate as u32,
                (self.bandwidth_khz * 10.0) as u32,
            )),
            RadioMode::Fsk => Some((
                RadioMode::Fsk,
                (self.bitrate_kbps * 1000.0) as u32,
                (self.deviation_khz * 1000.0) as u32,
                0,
            )),
        }
    }
}

#[derive(Debug)]
struct StationState {
    tuning: Tuning,
    receiving: bool,
    inbox: VecDeque<ReceivedPacket>,
    rssi: f32,
    snr: f32,
    failing: Option<&'static str>,
    bitrate_unsupported: bool,
    sent: Vec<Bytes>,
}

#[derive(Debug)]
struct Station {
    id: usize,
    state: Mutex<StationState>,
    rx: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Medium {
    stations: Mutex<Vec<Arc<Station>>>,
    loss: Mutex<f64>,
}

/// Shared medium
#[derive(Debug, Clone, Default)]
pub struct LoopbackAir {
    medium: Arc<Medium>,
}

impl LoopbackAir {
    /// Empty medium
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new radio
    pub fn radio(&self) -> LoopbackRadio {
        let mut stations = lock(&self.medium.stations);
        let station = Arc::new(Station {
            id: stations.len(),
            state: Mutex::new(StationState {
                tuning: Tuning::default(),
                receiving: false,
                inbox: VecDeque::new(),
                rssi: -80.0,
                snr: 8.0,
                failing: None,
                bitrate_unsupported: false,
                sent: Vec::new(),
            }),
            rx: Arc::new(Notify::new()),
        });
        stations.push(station.clone());
        LoopbackRadio {
            medium: self.medium.clone(),
            station,
        }
    }

    /// Probability in `0.0..=1.0` that a frame is lost on its way to each receiver
    pub fn set_loss(&self, probability: f64) {
        *lock(&self.medium.loss) = probability.clamp(0.0, 1.0);
    }
}

/// Radio attached to a [`LoopbackAir`]
#[derive(Debug)]
pub struct LoopbackRadio {
    medium: Arc<Medium>,
    station: Arc<Station>,
}

impl LoopbackRadio {
    /// Control handle that stays usable after the radio is moved into an engine
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            station: self.station.clone(),
        }
    }
}

/// Test control over one loopback radio
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    station: Arc<Station>,
}

impl LoopbackHandle {
    /// RSSI and SNR reported for packets this radio receives
    pub fn set_signal(&self, rssi: f32, snr: f32) {
        let mut state = lock(&self.station.state);
        state.rssi = rssi;
        state.snr = snr;
    }

    /// Make the named setting (or `"transmit"`) fail
    pub fn fail_setting(&self, name: Option<&'static str>) {
        lock(&self.station.state).failing = name;
    }

    /// Reject [`RadioSetting::BitRate`] as unsupported
    pub fn set_bitrate_unsupported(&self, unsupported: bool) {
        lock(&self.station.state).bitrate_unsupported = unsupported;
    }

    /// Deliver raw bytes as if they had been received
    pub fn inject(&self, data: &[u8]) {
        {
            let mut state = lock(&self.station.state);
            let packet = ReceivedPacket {
                data: Bytes::copy_from_slice(data),
                rssi: state.rssi,
                snr: state.snr,
            };
            state.inbox.push_back(packet);
        }
        self.station.rx.notify_one();
    }

    /// Frames transmitted so far
    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.station.state).sent.clone()
    }

    /// Whether the radio is in receive mode
    pub fn is_receiving(&self) -> bool {
        lock(&self.station.state).receiving
    }
}

impl LoopbackRadio {
    fn check(&self, name: &'static str) -> Result<(), TransportError> {
        if lock(&self.station.state).failing == Some(name) {
            return Err(TransportError::Command {
                setting: name,
                code: -1,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RadioTransport for LoopbackRadio {
    async fn standby(&mut self) -> Result<(), TransportError> {
        self.check("standby")?;
        lock(&self.station.state).receiving = false;
        Ok(())
    }

    async fn apply(&mut self, setting: RadioSetting) -> Result<(), TransportError> {
        self.check(setting.name())?;
        let mut state = lock(&self.station.state);
        let bitrate_unsupported = state.bitrate_unsupported;
        let tuning = &mut state.tuning;
        match setting {
            RadioSetting::Modem(mode) => tuning.mode = Some(mode),
            RadioSetting::SpreadingFactor(sf) => tuning.spreading_factor = sf,
            RadioSetting::CodingRate(cr) => tuning.coding_rate = cr,
            RadioSetting::Bandwidth(bw) => tuning.bandwidth_khz = bw,
            RadioSetting::BitRate(rate) => {
                if bitrate_unsupported {
                    return Err(TransportError::Unsupported("bit_rate"));
                }
                tuning.bitrate_kbps = rate;
            }
            RadioSetting::FrequencyDeviation(dev) => tuning.deviation_khz = dev,
            RadioSetting::Frequency(_)
            | RadioSetting::PreambleLength(_)
            | RadioSetting::Crc(_)
            | RadioSetting::OutputPower(_)
            | RadioSetting::SyncWord(_)
            | RadioSetting::RxBandwidth(_) => {}
        }
        Ok(())
    }

    async fn begin_fsk(&mut self, params: FskParams) -> Result<(), TransportError> {
        self.check("begin_fsk")?;
        let mut state = lock(&self.station.state);
        state.tuning.mode = Some(RadioMode::Fsk);
        state.tuning.bitrate_kbps = params.bitrate_kbps;
        state.tuning.deviation_khz = params.deviation_khz;
        Ok(())
    }

    async fn start_receive(&mut self) -> Result<(), TransportError> {
        self.check("start_receive")?;
        lock(&self.station.state).receiving = true;
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.check("transmit")?;
        let channel = {
            let mut state = lock(&self.station.state);
            state.receiving = false;
            state.sent.push(Bytes::copy_from_slice(frame));
            state.tuning.channel()
        };
        let Some(channel) = channel else {
            return Ok(());
        };

        let loss = *lock(&self.medium.loss);
        let stations = lock(&self.medium.stations).clone();
        for other in stations.iter().filter(|s| s.id != self.station.id) {
            if loss > 0.0 && rand::thread_rng().gen_bool(loss) {
                continue;
            }
            let delivered = {
                let mut state = lock(&other.state);
                if state.receiving && state.tuning.channel() == Some(channel) {
                    let packet = ReceivedPacket {
                        data: Bytes::copy_from_slice(frame),
                        rssi: state.rssi,
                        snr: state.snr,
                    };
                    state.inbox.push_back(packet);
                    true
                } else {
                    false
                }
            };
            if delivered {
                other.rx.notify_one();
            }
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<ReceivedPacket, TransportError> {
        lock(&self.station.state)
            .inbox
            .pop_front()
            .ok_or(TransportError::NoPacket)
    }

    fn rx_signal(&self) -> Arc<Notify> {
        self.station.rx.clone()
    }
}
