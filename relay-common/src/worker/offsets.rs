use std::collections::BTreeSet;

/// Tracks which dispatched offsets of one partition have completed.
///
/// Dispatches finish out of order, but only a contiguous prefix of the log
/// may be committed: committing past an unfinished dispatch would skip it
/// after a restart.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    pending: BTreeSet<i64>,
    lowest_dispatched: Option<i64>,
    highest_dispatched: Option<i64>,
    committed: Option<i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, offset: i64) {
        self.pending.insert(offset);
        self.lowest_dispatched = Some(self.lowest_dispatched.map_or(offset, |o| o.min(offset)));
        self.highest_dispatched = Some(self.highest_dispatched.map_or(offset, |o| o.max(offset)));
    }

    pub fn complete(&mut self, offset: i64) {
        self.pending.remove(&offset);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Highest offset such that every dispatched offset up to it completed.
    pub fn watermark(&self) -> Option<i64> {
        let highest = self.highest_dispatched?;
        match self.pending.first() {
            None => Some(highest),
            Some(&lowest_pending) => {
                let watermark = lowest_pending - 1;
                (watermark >= self.lowest_dispatched?).then_some(watermark)
            }
        }
    }

    /// The watermark, if it moved past the last commit.
    pub fn committable(&self) -> Option<i64> {
        let watermark = self.watermark()?;
        match self.committed {
            Some(committed) if committed >= watermark => None,
            _ => Some(watermark),
        }
    }

    pub fn mark_committed(&mut self, offset: i64) {
        self.committed = Some(self.committed.map_or(offset, |o| o.max(offset)));
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_commit_before_a_completion() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.committable(), None);

        tracker.begin(10);
        assert_eq!(tracker.committable(), None);

        tracker.complete(10);
        assert_eq!(tracker.committable(), Some(10));
    }

    #[test]
    fn watermark_stops_at_the_oldest_unfinished_dispatch() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..5 {
            tracker.begin(offset);
        }

        tracker.complete(0);
        tracker.complete(2);
        tracker.complete(3);
        assert_eq!(tracker.watermark(), Some(0));
        assert_eq!(tracker.pending(), 2);

        tracker.complete(1);
        assert_eq!(tracker.watermark(), Some(3));

        tracker.complete(4);
        assert_eq!(tracker.watermark(), Some(4));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn gaps_in_the_log_are_skipped() {
        let mut tracker = OffsetTracker::new();
        tracker.begin(3);
        tracker.begin(7);
        tracker.complete(7);
        assert_eq!(tracker.watermark(), None);

        tracker.complete(3);
        assert_eq!(tracker.watermark(), Some(7));
    }

    #[test]
    fn commits_only_move_forward() {
        let mut tracker = OffsetTracker::new();
        tracker.begin(0);
        tracker.complete(0);
        tracker.mark_committed(0);
        assert_eq!(tracker.committable(), None);

        tracker.begin(1);
        tracker.complete(1);
        assert_eq!(tracker.committable(), Some(1));
        tracker.mark_committed(1);
        tracker.mark_committed(0);
        assert_eq!(tracker.committed(), Some(1));
    }
}
