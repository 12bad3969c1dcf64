//! Link counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Monotonic link counters, updated lock free
        #[derive(Debug, Default)]
        pub struct LinkStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point in time copy of [`LinkStats`]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl LinkStats {
            /// Copy all counters
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Frames handed to the radio
    frames_sent,
    /// Valid frames received
    frames_received,
    /// Inbound frames rejected by validation or integrity checks
    rx_errors,
    /// Transmit failures, including radio lock timeouts
    tx_errors,
    /// Frames that could not be built
    framing_errors,
    /// Enqueue attempts that timed out
    queue_full,
    /// Inbound frames dropped because the inbound queue was full
    inbound_dropped,
    /// Frames addressed to another node
    foreign_frames,
    /// Internal locks not acquired in time
    lock_timeouts,
    /// Acknowledgements that matched a pending frame
    acks_matched,
    /// Acknowledgements with nothing pending under the id
    duplicate_acks,
    /// Retransmissions
    retries,
    /// Pending frames dropped after exhausting retries
    retry_exhausted,
    /// Frames folded into aggregates
    aggregations,
    /// Bulk ACK frames sent
    bulk_acks_sent,
    /// Profile switches applied
    profile_switches,
}

impl LinkStats {
    /// Increment a counter
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = LinkStats::default();
        LinkStats::bump(&stats.rx_errors);
        LinkStats::bump(&stats.rx_errors);
        LinkStats::bump(&stats.acks_matched);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rx_errors, 2);
        assert_eq!(snapshot.acks_matched, 1);
        assert_eq!(snapshot.tx_errors, 0);
    }
}
