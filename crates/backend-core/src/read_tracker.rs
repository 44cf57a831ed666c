pub const DEFAULT_READ_MIN_INTERVAL_MS: u64 = 800;

/// One read report to send to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReport {
    pub conversation_id: i64,
    /// `None` reports "read up to now".
    pub up_to_message_id: Option<i64>,
    pub requested_at_ms: u64,
}

/// Throttles read reports for the open conversation.
///
/// A report that is not strictly newer than the last acknowledged one is
/// suppressed until `min_interval_ms` passed since that report was issued.
/// At most one report is in flight.
#[derive(Debug, Clone)]
pub struct ReadTracker {
    min_interval_ms: u64,
    conversation_id: Option<i64>,
    last_reported_id: Option<i64>,
    last_reported_at_ms: Option<u64>,
    in_flight: bool,
}

impl Default for ReadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_READ_MIN_INTERVAL_MS)
    }
}

impl ReadTracker {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            conversation_id: None,
            last_reported_id: None,
            last_reported_at_ms: None,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_reported_id(&self) -> Option<i64> {
        self.last_reported_id
    }

    pub fn reset(&mut self, conversation_id: Option<i64>) {
        self.conversation_id = conversation_id;
        self.last_reported_id = None;
        self.last_reported_at_ms = None;
        self.in_flight = false;
    }

    pub fn begin(&mut self, up_to_message_id: Option<i64>, now_ms: u64) -> Option<ReadReport> {
        let conversation_id = self.conversation_id?;
        if self.in_flight {
            return None;
        }

        let strictly_newer = match (up_to_message_id, self.last_reported_id) {
            (Some(next), Some(last)) => next > last,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let within_interval = self
            .last_reported_at_ms
            .is_some_and(|at| now_ms.saturating_sub(at) < self.min_interval_ms);

        if !strictly_newer && within_interval {
            return None;
        }

        self.in_flight = true;
        Some(ReadReport {
            conversation_id,
            up_to_message_id,
            requested_at_ms: now_ms,
        })
    }

    /// Record the outcome of a report. Returns `false` for a stale report
    /// from a previous conversation.
    pub fn complete(&mut self, report: ReadReport, success: bool) -> bool {
        if self.conversation_id != Some(report.conversation_id) || !self.in_flight {
            return false;
        }
        self.in_flight = false;

        if success {
            if let Some(id) = report.up_to_message_id {
                self.last_reported_id = Some(self.last_reported_id.map_or(id, |last| last.max(id)));
            }
            self.last_reported_at_ms = Some(report.requested_at_ms);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReadTracker {
        let mut tracker = ReadTracker::default();
        tracker.reset(Some(1));
        tracker
    }

    #[test]
    fn lower_and_repeated_ids_are_suppressed_within_interval() {
        let mut tracker = tracker();
        let mut sent = Vec::new();

        for (id, now) in [(5, 0), (3, 100), (7, 200)] {
            if let Some(report) = tracker.begin(Some(id), now) {
                sent.push(report.up_to_message_id);
                assert!(tracker.complete(report, true));
            }
        }

        assert_eq!(sent, vec![Some(5), Some(7)]);
    }

    #[test]
    fn calls_while_in_flight_are_dropped() {
        let mut tracker = tracker();
        let first = tracker.begin(Some(5), 0).expect("first report");
        assert!(tracker.begin(Some(9), 10).is_none());

        tracker.complete(first, true);
        assert!(tracker.begin(Some(9), 30).is_some());
    }

    #[test]
    fn interval_elapsing_allows_repeat_reports() {
        let mut tracker = tracker();
        let report = tracker.begin(None, 0).expect("argument-less report");
        tracker.complete(report, true);

        assert!(tracker.begin(None, 500).is_none());
        assert!(tracker.begin(None, 800).is_some());
    }

    #[test]
    fn failure_does_not_advance_last_report() {
        let mut tracker = tracker();
        let report = tracker.begin(Some(5), 0).expect("report");
        tracker.complete(report, false);

        assert_eq!(tracker.last_reported_id(), None);
        assert!(tracker.begin(Some(5), 10).is_some());
    }

    #[test]
    fn switching_conversation_resets_and_ignores_stale_completion() {
        let mut tracker = tracker();
        let report = tracker.begin(Some(5), 0).expect("report");
        tracker.reset(Some(2));

        assert!(!tracker.complete(report, true));
        assert_eq!(tracker.last_reported_id(), None);
        assert!(!tracker.in_flight());
    }
}
