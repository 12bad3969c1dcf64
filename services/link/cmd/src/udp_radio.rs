//! Radio simulated over UDP.
//!
//! Each datagram is `channel (u32 BE) | crc32 (u32 BE) | frame`. The
//! channel is a fingerprint of the modulation settings, so a node only hears
//! peers configured with the same profile, and only while in receive mode.
//! Datagrams whose CRC does not match are surfaced as integrity failures.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use link_engine::{FskParams, RadioMode, RadioSetting, RadioTransport, ReceivedPacket, TransportError};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PREAMBLE_LEN: usize = 8;
const MAX_DATAGRAM: usize = 512;
/// Arrivals held for the engine before new ones are dropped
const INBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Modulation {
    mode: Option<RadioMode>,
    frequency_mhz: f32,
    spreading_factor: u8,
    coding_rate: u8,
    bandwidth_khz: f32,
    bitrate_kbps: f32,
    deviation_khz: f32,
}

impl Modulation {
    /// Channel fingerprint; 0 while no modem is selected
    fn channel(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        match self.mode {
            None => return 0,
            Some(RadioMode::LoRa) => {
                hasher.update(b"lora");
                hasher.update(&[self.spreading_factor, self.coding_rate]);
                hasher.update(&self.bandwidth_khz.to_bits().to_be_bytes());
            }
            Some(RadioMode::Fsk) => {
                hasher.update(b"fsk");
                hasher.update(&self.bitrate_kbps.to_bits().to_be_bytes());
                hasher.update(&self.deviation_khz.to_bits().to_be_bytes());
            }
        }
        hasher.update(&self.frequency_mhz.to_bits().to_be_bytes());
        hasher.finalize().max(1)
    }
}

enum Arrival {
    Frame(Bytes),
    Corrupt,
}

struct Station {
    inbox: Mutex<VecDeque<Arrival>>,
    channel: AtomicU32,
    receiving: AtomicBool,
    rx: Arc<Notify>,
}

impl Station {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::with_capacity(INBOX_CAPACITY)),
            channel: AtomicU32::new(0),
            receiving: AtomicBool::new(false),
            rx: Arc::new(Notify::new()),
        }
    }

    /// Queue an arrival; returns `false` when the inbox is full
    fn push(&self, arrival: Arrival) -> bool {
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
            if inbox.len() >= INBOX_CAPACITY {
                return false;
            }
            inbox.push_back(arrival);
        }
        self.rx.notify_one();
        true
    }
}

/// Radio backed by a UDP socket
pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    modulation: Modulation,
    station: Arc<Station>,
    rssi: f32,
    snr: f32,
    listener: JoinHandle<()>,
}

impl UdpRadio {
    /// Bind the socket and start listening
    pub async fn bind(bind: SocketAddr, peers: Vec<SocketAddr>, rssi: f32, snr: f32) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let station = Arc::new(Station::new());
        let listener = tokio::spawn(listen(socket.clone(), station.clone()));
        debug!("UDP radio bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peers,
            modulation: Modulation::default(),
            station,
            rssi,
            snr,
            listener,
        })
    }

    #[cfg(test)]
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[cfg(test)]
    fn set_peers(&mut self, peers: Vec<SocketAddr>) {
        self.peers = peers;
    }

    fn retune(&self) {
        self.station
            .channel
            .store(self.modulation.channel(), Ordering::Release);
    }
}

impl Drop for UdpRadio {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(socket: Arc<UdpSocket>, station: Arc<Station>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP radio receive failed: {}", e);
                continue;
            }
        };
        if len < PREAMBLE_LEN {
            debug!("Runt datagram ({} bytes) from {}", len, from);
            continue;
        }

        let mut datagram = &buf[..len];
        let channel = datagram.get_u32();
        let crc = datagram.get_u32();
        if !station.receiving.load(Ordering::Acquire)
            || channel != station.channel.load(Ordering::Acquire)
        {
            // not listening, or tuned elsewhere
            continue;
        }
        let arrival = if crc32fast::hash(datagram) != crc {
            Arrival::Corrupt
        } else {
            Arrival::Frame(Bytes::copy_from_slice(datagram))
        };
        if !station.push(arrival) {
            debug!("Inbox full, datagram from {} dropped", from);
        }
    }
}

#[async_trait]
impl RadioTransport for UdpRadio {
    async fn standby(&mut self) -> Result<(), TransportError> {
        self.station.receiving.store(false, Ordering::Release);
        Ok(())
    }

    async fn apply(&mut self, setting: RadioSetting) -> Result<(), TransportError> {
        let m = &mut self.modulation;
        match setting {
            RadioSetting::Modem(mode) => m.mode = Some(mode),
            RadioSetting::Frequency(mhz) => m.frequency_mhz = mhz,
            RadioSetting::SpreadingFactor(sf) => m.spreading_factor = sf,
            RadioSetting::CodingRate(cr) => m.coding_rate = cr,
            RadioSetting::Bandwidth(khz) => m.bandwidth_khz = khz,
            RadioSetting::BitRate(kbps) => m.bitrate_kbps = kbps,
            RadioSetting::FrequencyDeviation(khz) => m.deviation_khz = khz,
            RadioSetting::PreambleLength(_)
            | RadioSetting::Crc(_)
            | RadioSetting::OutputPower(_)
            | RadioSetting::SyncWord(_)
            | RadioSetting::RxBandwidth(_) => {}
        }
        self.retune();
        Ok(())
    }

    async fn begin_fsk(&mut self, params: FskParams) -> Result<(), TransportError> {
        self.modulation.mode = Some(RadioMode::Fsk);
        self.modulation.bitrate_kbps = params.bitrate_kbps;
        self.modulation.deviation_khz = params.deviation_khz;
        self.retune();
        Ok(())
    }

    async fn start_receive(&mut self) -> Result<(), TransportError> {
        self.station.receiving.store(true, Ordering::Release);
        Ok(())
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.station.receiving.store(false, Ordering::Release);
        let mut datagram = BytesMut::with_capacity(PREAMBLE_LEN + frame.len());
        datagram.put_u32(self.modulation.channel());
        datagram.put_u32(crc32fast::hash(frame));
        datagram.put_slice(frame);

        for peer in &self.peers {
            self.socket.send_to(&datagram, peer).await?;
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<ReceivedPacket, TransportError> {
        let arrival = self
            .station
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match arrival {
            Some(Arrival::Frame(data)) => Ok(ReceivedPacket {
                data,
                rssi: self.rssi,
                snr: self.snr,
            }),
            Some(Arrival::Corrupt) => Err(TransportError::Integrity),
            None => Err(TransportError::NoPacket),
        }
    }

    fn rx_signal(&self) -> Arc<Notify> {
        self.station.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_engine::profile;
    use link_engine::radio::configure;
    use link_engine::RfConfig;
    use std::time::Duration;

    async fn pair(profile_a: u8, profile_b: u8) -> (UdpRadio, UdpRadio) {
        let any = SocketAddr::from(([127, 0, 0, 1], 0));
        let mut a = UdpRadio::bind(any, vec![], -70.0, 8.0).await.unwrap();
        let mut b = UdpRadio::bind(any, vec![], -90.0, 3.0).await.unwrap();
        a.set_peers(vec![b.local_addr().unwrap()]);
        b.set_peers(vec![a.local_addr().unwrap()]);

        let rf = RfConfig::default();
        configure(&mut a, profile(profile_a).unwrap(), &rf).await.unwrap();
        configure(&mut b, profile(profile_b).unwrap(), &rf).await.unwrap();
        a.start_receive().await.unwrap();
        b.start_receive().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_same_profile_hears_frame() {
        let (mut a, mut b) = pair(0, 0).await;
        let signal = b.rx_signal();
        let notified = signal.notified();

        a.transmit(b"\x01\x02S\x05\x00\x00").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), notified)
            .await
            .unwrap();

        let packet = b.read_packet().await.unwrap();
        assert_eq!(&packet.data[..], b"\x01\x02S\x05\x00\x00");
        assert_eq!(packet.rssi, -90.0);
        assert!(matches!(b.read_packet().await, Err(TransportError::NoPacket)));
    }

    #[test]
    fn test_inbox_capacity() {
        let station = Station::new();
        for n in 0..INBOX_CAPACITY {
            assert!(station.push(Arrival::Frame(Bytes::from(vec![n as u8]))));
        }
        assert!(!station.push(Arrival::Corrupt));
        let inbox = station.inbox.lock().unwrap();
        assert_eq!(inbox.len(), INBOX_CAPACITY);
        assert!(matches!(inbox.back(), Some(Arrival::Frame(data)) if data[..] == [31]));
    }

    #[tokio::test]
    async fn test_other_profile_hears_nothing() {
        let (mut a, mut b) = pair(0, 3).await;
        a.transmit(b"\x01\x02S\x05\x00\x00").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(b.read_packet().await, Err(TransportError::NoPacket)));
    }

    #[tokio::test]
    async fn test_corrupt_datagram_fails_integrity() {
        let (_a, mut b) = pair(8, 8).await;
        let signal = b.rx_signal();
        let notified = signal.notified();

        let mut modulation = Modulation::default();
        let descriptor = profile(8).unwrap();
        modulation.mode = Some(RadioMode::LoRa);
        modulation.frequency_mhz = 863.0;
        modulation.spreading_factor = descriptor.spreading_factor;
        modulation.coding_rate = descriptor.coding_rate;
        modulation.bandwidth_khz = descriptor.bandwidth_khz;

        let mut datagram = BytesMut::new();
        datagram.put_u32(modulation.channel());
        datagram.put_u32(0xDEAD_BEEF);
        datagram.put_slice(b"\x01\x02S\x05\x00\x00");
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&datagram, b.local_addr().unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), notified)
            .await
            .unwrap();
        assert!(matches!(b.read_packet().await, Err(TransportError::Integrity)));
    }
}
