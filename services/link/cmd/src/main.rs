//! LoRa/FSK link node.
//!
//! Runs one link engine over a UDP-simulated radio. The node answers pings,
//! optionally sends heartbeats to its peer, logs link events and prints a
//! JSON diagnostics snapshot at a fixed interval.

use anyhow::Context;
use clap::Parser;
use link_engine::{InboundFrame, LinkEngine, LinkEvent};
use link_wire::{Address, LogicalPacket, PacketType};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod udp_radio;

use config::NodeConfig;
use logging::LinkLogFormatter;
use udp_radio::UdpRadio;

/// LoRa/FSK reliable link node
#[derive(Parser, Debug)]
#[command(name = "lora-link", version, about = "LoRa/FSK reliable link node over a simulated radio")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "lora-link.yaml")]
    config: PathBuf,

    /// Own link address
    #[arg(long)]
    address: Option<u8>,

    /// Peer link address
    #[arg(long)]
    peer: Option<u8>,

    /// Initial profile index (0-12)
    #[arg(long)]
    profile: Option<u8>,

    /// UDP bind address of the simulated radio, e.g. 127.0.0.1:7001
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// UDP address of another simulated radio (repeatable)
    #[arg(long = "peer-addr")]
    peer_addrs: Vec<SocketAddr>,

    /// Heartbeat interval, e.g. 5s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Negotiate this profile with the peer after start
    #[arg(long)]
    request_profile: Option<u8>,

    /// Enable automatic profile selection
    #[arg(long)]
    auto_asa: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(peer) = self.peer {
            config.peer = peer;
        }
        if let Some(profile) = self.profile {
            config.initial_profile = profile;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if !self.peer_addrs.is_empty() {
            config.peers = self.peer_addrs.clone();
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat_interval = Some(heartbeat.to_string());
        }
        if self.request_profile.is_some() {
            config.request_profile = self.request_profile;
        }
        if self.auto_asa {
            config.auto_asa.enabled = true;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("lora_link={}", args.log_level).parse()?)
        .add_directive(format!("link_engine={}", args.log_level).parse()?)
        .add_directive(format!("link_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(LinkLogFormatter::new("lora-link"))
        .init();

    info!("Starting LoRa link node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    let link_config = config.to_link_config()?;
    let stats_interval = config.stats_interval()?;
    let heartbeat_interval = config.heartbeat_interval()?;
    let peer = Address(config.peer);

    let radio = UdpRadio::bind(config.bind, config.peers.clone(), config.rssi, config.snr)
        .await
        .with_context(|| format!("binding simulated radio on {}", config.bind))?;
    component_info!(
        "radio",
        "Simulated radio on {} reporting rssi {:.1} snr {:.1}, peers {:?}",
        config.bind,
        config.rssi,
        config.snr,
        config.peers
    );

    let (engine, mut events) = LinkEngine::start(link_config, Box::new(radio)).await?;
    let engine = Arc::new(engine);

    if let Some(profile) = config.request_profile {
        if let Err(e) = engine.request_profile(peer, profile).await {
            component_warn!("asa", "Startup negotiation for profile {} failed: {}", profile, e);
        }
    }

    let mut background = vec![tokio::spawn(serve_inbound(engine.clone()))];
    if let Some(period) = heartbeat_interval {
        background.push(tokio::spawn(heartbeat(engine.clone(), peer, period)));
    }

    let mut stats_ticker = tokio::time::interval(stats_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    component_error!("node", "Signal handler failed: {}", e);
                }
                break;
            }
            Some(event) = events.recv() => log_event(&event),
            _ = stats_ticker.tick() => {
                match serde_json::to_string(&engine.diagnostics().await) {
                    Ok(json) => component_info!("stats", "{}", json),
                    Err(e) => component_warn!("stats", "Diagnostics not serializable: {}", e),
                }
            }
        }
    }

    info!("Shutting down");
    for task in background {
        task.abort();
    }
    engine.shutdown();
    Ok(())
}

fn log_event(event: &LinkEvent) {
    match event {
        LinkEvent::Acked { id, from, original_type } => {
            component_debug!("ack", "Frame {} (type {}) acknowledged by {}", id, original_type, from);
        }
        LinkEvent::RetryExhausted { id, to, packet_type } => {
            component_warn!("retry", "Frame {} (type {}) to {} was never acknowledged", id, packet_type, to);
        }
        LinkEvent::ProfileChanged { profile, mode } => {
            component_info!("profile", "Now on profile {} ({})", profile, mode);
        }
        LinkEvent::SwitchScheduled { target } => {
            component_info!("asa", "Switch to profile {} scheduled", target);
        }
    }
}

/// Consume inbound frames: answer pings, log the rest
async fn serve_inbound(engine: Arc<LinkEngine>) {
    loop {
        let Some(InboundFrame { frame, rssi, snr }) =
            engine.receive_timeout(Duration::from_secs(1)).await
        else {
            continue;
        };
        let sender = frame.header.sender;
        match frame.packet_type() {
            PacketType::Ping => {
                let pong = LogicalPacket::new(PacketType::Pong).with_len(frame.payload.len() as u8);
                if let Err(e) = engine.send(sender, &pong, Some(&frame.payload)).await {
                    component_warn!("app", "Pong to {} not sent: {}", sender, e);
                }
            }
            PacketType::Heartbeat => {
                component_info!(
                    "app",
                    "Heartbeat from {} ({} bytes, rssi {:.1}, snr {:.1})",
                    sender,
                    frame.payload.len(),
                    rssi,
                    snr
                );
            }
            other => {
                component_info!(
                    "app",
                    "Frame {} type {} from {}: {} bytes",
                    frame.id(),
                    other,
                    sender,
                    frame.payload.len()
                );
            }
        }
    }
}

/// Periodic heartbeat to the peer: uptime in seconds and current profile
async fn heartbeat(engine: Arc<LinkEngine>, peer: Address, period: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let uptime = started.elapsed().as_secs() as u32;
        let mut payload = uptime.to_be_bytes().to_vec();
        payload.push(engine.link_state().profile);

        let packet = LogicalPacket::new(PacketType::Heartbeat)
            .with_len(payload.len() as u8)
            .ack_required();
        if let Err(e) = engine.send(peer, &packet, Some(&payload)).await {
            component_warn!("app", "Heartbeat to {} not queued: {}", peer, e);
        }
    }
}
