//! Reliable link engine for half-duplex LoRa/FSK radios.
//!
//! The engine sits between an application and a [`RadioTransport`]. It
//! frames outgoing packets with [`link_wire`], queues them with priorities,
//! folds small packets into aggregates, tracks frames that need an
//! acknowledgement and retries them with profile dependent timeouts,
//! batches outgoing ACKs, and negotiates radio profile changes with the
//! peer so both ends switch together.
//!
//! ```text
//!  application ──send──▶ outgoing queue ──drain──▶ radio
//!       ▲                     ▲  retry scan              │
//!       │                  pending list                  │ interrupt
//!       └──receive── inbound queue ◀──dispatch── receive ◀┘
//! ```
//!
//! [`LoopbackAir`] provides an in-memory medium for tests and simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
mod actors;
pub mod config;
mod dispatch;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod negotiation;
pub mod neighbor;
pub mod pacing;
pub mod pending;
pub mod profile;
pub mod queue;
pub mod radio;
pub mod stats;
pub mod transport;

pub use config::{AutoAsaConfig, LinkConfig, RfConfig};
pub use engine::{Diagnostics, InboundFrame, LinkEngine, LinkEvent, QueueStatus};
pub use error::{LinkError, TransportError};
pub use loopback::{LoopbackAir, LoopbackHandle, LoopbackRadio};
pub use negotiation::NegotiationPhase;
pub use neighbor::{NeighborInfo, NeighborRecord};
pub use pending::PendingInfo;
pub use profile::{describe_profile, profile, LinkState, ProfileDescriptor, RadioMode, RetryParams, PROFILE_COUNT};
pub use stats::StatsSnapshot;
pub use transport::{FskParams, RadioSetting, RadioTransport, ReceivedPacket};
