//! # Protocol Statistics
//!
//! Per-role counters exposed for JSON export and test assertions.

use serde::Serialize;

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Total messages emitted (data + control).
    pub messages_sent: u64,
    /// DATA segments sent on their first pass.
    pub segments_sent: u64,
    /// Parity segments sent (proactive and repair).
    pub parity_sent: u64,
    /// DATA segments retransmitted from repair requests.
    pub repairs_sent: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// NACK messages processed.
    pub nacks_received: u64,
    /// ACK messages processed.
    pub acks_received: u64,
    /// GRTT probes sent.
    pub probes_sent: u64,
    /// Objects evicted from the tx cache.
    pub objects_purged: u64,
    /// Enqueue attempts refused by flow control.
    pub enqueue_rejected: u64,
}

/// Aggregate receiver-side statistics, tracked per remote sender.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Messages received and parsed.
    pub messages_received: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Messages dropped as malformed.
    pub parse_errors: u64,
    /// Duplicate segments discarded.
    pub duplicates: u64,
    /// Source segments recovered by FEC decoding.
    pub fec_recoveries: u64,
    /// Decode attempts that failed (left pending for repair).
    pub decode_failures: u64,
    /// NACK messages emitted.
    pub nacks_sent: u64,
    /// NACKs suppressed by overheard requests.
    pub nacks_suppressed: u64,
    /// Objects completed.
    pub objects_completed: u64,
    /// Objects aborted or evicted.
    pub objects_aborted: u64,
    /// Segments dropped for lack of buffer space.
    pub buffer_drops: u64,
}

impl ReceiverStats {
    /// Fraction of delivered source segments that needed FEC recovery.
    pub fn recovery_rate(&self) -> f64 {
        if self.messages_received == 0 {
            0.0
        } else {
            self.fec_recoveries as f64 / self.messages_received as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_serialize_to_json() {
        let stats = SenderStats {
            messages_sent: 10,
            segments_sent: 8,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"messages_sent\":10"));
        assert!(json.contains("\"segments_sent\":8"));
    }

    #[test]
    fn recovery_rate_zero_safe() {
        assert_eq!(ReceiverStats::default().recovery_rate(), 0.0);
    }
}
