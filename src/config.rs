//! Session tunables.

use std::time::Duration;

/// Bundled tunables for a [`crate::session::Session`].
/// A plain `Default`-able struct rather than a builder, since every field
/// has a sensible stand-alone default and callers typically only override
/// one or two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum bytes per outbound fragment.
    pub chunk_size: u64,
    /// Byte threshold used when deciding whether an RTT sample is large
    /// enough to justify recomputing the outstanding-bytes cap.
    pub ack_thresh: u64,
    /// Per-transmit-pass byte cap.
    pub send_thresh: u64,
    /// Default receive-window advertised for newly accepted flows.
    pub default_rcvbuf: u64,
    /// Width of one RTT-history bucket.
    pub rtt_history_thresh: Duration,
    /// Number of RTT-history buckets retained.
    pub rtt_history_capacity: usize,
    /// Floor for the outstanding-bytes cap.
    pub min_outstanding_thresh: u64,
    /// Initial value of the outstanding-bytes cap, before any RTT sample.
    pub initial_outstanding_thresh: u64,
    /// Extra delay budget added to base RTT when deriving the outstanding
    /// bytes cap from bandwidth.
    pub max_additional_delay: Duration,
    /// Batch size for minting new free send-flow IDs.
    pub send_flow_id_batch_size: u64,
    /// Refill the free-ID queue once its length drops below this.
    pub send_flow_id_refresh: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            chunk_size: 1400,
            ack_thresh: 2800,
            send_thresh: 32 * 1400,
            default_rcvbuf: 2_097_151,
            rtt_history_thresh: Duration::from_secs(60),
            rtt_history_capacity: 5,
            min_outstanding_thresh: 16_384,
            initial_outstanding_thresh: 32_768,
            max_additional_delay: Duration::from_millis(20),
            send_flow_id_batch_size: 16,
            send_flow_id_refresh: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_transport() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.chunk_size, 1400);
        assert_eq!(cfg.send_thresh, 44_800);
        assert_eq!(cfg.rtt_history_capacity, 5);
        assert_eq!(cfg.send_flow_id_batch_size, 16);
        assert_eq!(cfg.send_flow_id_refresh, 4);
    }
}
