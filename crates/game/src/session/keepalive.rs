use std::collections::HashMap;

/// Snapshot of keepalive statistics for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepaliveStats {
    pub sent: u32,
    pub received: u32,
    pub last_rtt_ms: u64,
    pub avg_rtt_ms: u64,
}

impl KeepaliveStats {
    pub fn missed(&self) -> u32 {
        self.sent.saturating_sub(self.received)
    }
}

/// Tracks outstanding liveness probes and round-trip statistics.
/// Probe ids increase monotonically between resets; replies are matched
/// by id, never by arrival order.
#[derive(Debug, Default)]
pub struct KeepaliveTracker {
    outstanding: HashMap<u32, u64>,
    next_id: u32,
    replies: u32,
    last_rtt_ms: u64,
    avg_rtt_ms: i64,
}

impl KeepaliveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all outstanding probes and zero every counter and id.
    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.next_id = 0;
        self.replies = 0;
        self.last_rtt_ms = 0;
        self.avg_rtt_ms = 0;
    }

    /// Allocate the next probe id and record its send time. The caller
    /// transmits the framed probe.
    pub fn begin_probe(&mut self, now_ms: u64) -> u32 {
        self.next_id += 1;
        self.outstanding.insert(self.next_id, now_ms);
        self.next_id
    }

    /// Match a reply to its probe and fold the round-trip time into the
    /// running average. Unknown ids are reported and ignored; the probe
    /// may simply have been cleared by a reset.
    pub fn on_reply(&mut self, id: u32, now_ms: u64) -> Option<u64> {
        let Some(sent_ms) = self.outstanding.remove(&id) else {
            log::warn!("received keepalive reply for unknown id {id}");
            return None;
        };

        let rtt = now_ms.saturating_sub(sent_ms);
        self.replies += 1;
        self.last_rtt_ms = rtt;
        self.avg_rtt_ms += (rtt as i64 - self.avg_rtt_ms) / self.replies as i64;
        Some(rtt)
    }

    /// Drop outstanding probes without touching the statistics. Used
    /// when the transport goes away: replies can no longer arrive, but
    /// the session's numbers stay visible until the next reset.
    pub fn abandon_outstanding(&mut self) {
        self.outstanding.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> KeepaliveStats {
        KeepaliveStats {
            sent: self.next_id,
            received: self.replies,
            last_rtt_ms: self.last_rtt_ms,
            avg_rtt_ms: self.avg_rtt_ms.max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average_matches_recurrence() {
        let mut tracker = KeepaliveTracker::new();
        let rtts: [u64; 5] = [100, 40, 250, 10, 90];

        let mut expected: i64 = 0;
        for (i, rtt) in rtts.iter().enumerate() {
            let sent = 1000 * i as u64;
            let id = tracker.begin_probe(sent);
            assert_eq!(tracker.on_reply(id, sent + rtt), Some(*rtt));

            expected += (*rtt as i64 - expected) / (i as i64 + 1);
            assert_eq!(tracker.stats().avg_rtt_ms, expected as u64);
            assert_eq!(tracker.stats().last_rtt_ms, *rtt);
        }

        assert_eq!(tracker.stats().sent, 5);
        assert_eq!(tracker.stats().received, 5);
        assert_eq!(tracker.stats().missed(), 0);
    }

    #[test]
    fn test_constant_rtt_average_is_exact() {
        let mut tracker = KeepaliveTracker::new();
        for i in 0..10u64 {
            let id = tracker.begin_probe(i * 500);
            tracker.on_reply(id, i * 500 + 42);
        }
        assert_eq!(tracker.stats().avg_rtt_ms, 42);
    }

    #[test]
    fn test_out_of_order_replies_match_by_id() {
        let mut tracker = KeepaliveTracker::new();
        let a = tracker.begin_probe(0);
        let b = tracker.begin_probe(100);

        assert_eq!(tracker.on_reply(b, 150), Some(50));
        assert_eq!(tracker.on_reply(a, 200), Some(200));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_unknown_reply_does_not_alter_statistics() {
        let mut tracker = KeepaliveTracker::new();
        let id = tracker.begin_probe(0);
        tracker.on_reply(id, 80);
        let before = tracker.stats();

        assert_eq!(tracker.on_reply(999, 500), None);
        assert_eq!(tracker.stats(), before);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut tracker = KeepaliveTracker::new();
        let id = tracker.begin_probe(0);
        tracker.on_reply(id, 30);
        tracker.begin_probe(100);

        tracker.reset();
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.stats(), KeepaliveStats::default());

        // Ids restart after a reset; a stale reply must be a no-op.
        assert_eq!(tracker.on_reply(2, 400), None);
        let id = tracker.begin_probe(200);
        assert_eq!(id, 1);
    }

    #[test]
    fn test_abandon_keeps_statistics() {
        let mut tracker = KeepaliveTracker::new();
        let id = tracker.begin_probe(0);
        tracker.on_reply(id, 60);
        tracker.begin_probe(100);

        tracker.abandon_outstanding();
        assert_eq!(tracker.outstanding(), 0);
        assert_eq!(tracker.stats().received, 1);
        assert_eq!(tracker.stats().avg_rtt_ms, 60);
        assert_eq!(tracker.on_reply(2, 300), None);
    }
}
