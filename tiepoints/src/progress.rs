//! Progress reporting for tie-points location.

use std::sync::Arc;

/// Progress information for a locator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorProgress {
    /// Current step (0-based).
    pub current: usize,
    /// Total number of steps.
    pub total: usize,
    pub stage: LocatorStage,
}

/// Stage of a locator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum LocatorStage {
    /// Matching interest points on the subsampled rasters.
    CoarseMatching,
    /// Filtering the coarse tie-points into a guiding transformation.
    CoarseFiltering,
    /// Matching interest points at full resolution.
    Matching,
    /// Final outlier filtering.
    Filtering,
    Done,
}

/// Callback type for progress reporting.
pub type ProgressCallback = Arc<dyn Fn(LocatorProgress) + Send + Sync>;

/// Steps through a fixed sequence of stages, reporting each one.
pub(crate) struct ProgressReporter {
    callback: Option<ProgressCallback>,
    current: usize,
    total: usize,
}

impl ProgressReporter {
    pub(crate) fn new(callback: Option<ProgressCallback>, total: usize) -> Self {
        Self {
            callback,
            current: 0,
            total,
        }
    }

    pub(crate) fn report(&mut self, stage: LocatorStage) {
        if let Some(callback) = self.callback.as_ref() {
            callback(LocatorProgress {
                current: self.current.min(self.total),
                total: self.total,
                stage,
            });
        }
        self.current += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_reporter_counts_steps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().push(p));

        let mut reporter = ProgressReporter::new(Some(callback), 2);
        reporter.report(LocatorStage::Matching);
        reporter.report(LocatorStage::Done);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].current, 0);
        assert_eq!(seen[0].stage, LocatorStage::Matching);
        assert_eq!(seen[1].current, 1);
        assert_eq!(seen[1].total, 2);
    }

    #[test]
    fn test_reporter_without_callback_is_silent() {
        let mut reporter = ProgressReporter::new(None, 1);
        reporter.report(LocatorStage::Done);
        assert_eq!(reporter.current, 1);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(LocatorStage::CoarseMatching.to_string(), "CoarseMatching");
    }
}
