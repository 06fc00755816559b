//! Download progress reporting.

/// Snapshot passed to the `on_progress` callback after each written chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes written so far
    pub current: u64,
    /// Expected size from `Content-Length`, if the server sent one
    pub total: Option<u64>,
    /// Completion in percent (0..=100), `None` when `total` is unknown
    pub percent: Option<u8>,
}

impl Progress {
    #[must_use]
    pub fn new(current: u64, total: Option<u64>) -> Self {
        let percent = total.map(|total| {
            let pct = current
                .saturating_mul(100)
                .checked_div(total)
                .unwrap_or(100)
                .min(100);
            u8::try_from(pct).unwrap_or(100)
        });
        Self {
            current,
            total,
            percent,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.current >= total)
    }
}

/// Accumulates written bytes and fires the callback.
pub(crate) struct ProgressTracker<'a> {
    callback: Option<&'a (dyn Fn(Progress) + Send + Sync)>,
    total: Option<u64>,
    current: u64,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        callback: Option<&'a (dyn Fn(Progress) + Send + Sync)>,
        total: Option<u64>,
    ) -> Self {
        Self {
            callback,
            total,
            current: 0,
        }
    }

    pub(crate) fn advance(&mut self, written: usize) {
        self.current = self
            .current
            .saturating_add(u64::try_from(written).unwrap_or(u64::MAX));
        if let Some(callback) = self.callback {
            callback(Progress::new(self.current, self.total));
        }
    }

    pub(crate) fn written(&self) -> u64 {
        self.current
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_percent_known_total() {
        let p = Progress::new(50, Some(200));
        assert_eq!(p.percent, Some(25));
        assert!(!p.is_complete());
        assert_eq!(Progress::new(200, Some(200)).percent, Some(100));
    }

    #[test]
    fn test_percent_unknown_or_zero_total() {
        assert_eq!(Progress::new(10, None).percent, None);
        assert_eq!(Progress::new(0, Some(0)).percent, Some(100));
        assert_eq!(Progress::new(300, Some(200)).percent, Some(100));
    }

    #[test]
    fn test_tracker_reports_cumulative_bytes() {
        let seen = Mutex::new(Vec::new());
        let callback = |p: Progress| seen.lock().push(p.current);
        let mut tracker = ProgressTracker::new(Some(&callback), Some(10));

        tracker.advance(4);
        tracker.advance(6);

        assert_eq!(tracker.written(), 10);
        assert_eq!(*seen.lock(), vec![4, 10]);
    }
}
