use canopy_core::job::JobState;

use crate::job::JobResult;

/// Per-state and per-result job counters for summary reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub depend: usize,
    pub priority: usize,
    pub sched: usize,
    pub run: usize,
    pub cleanup: usize,
    pub inactive: usize,
    pub successful: usize,
    pub failed: usize,
    pub canceled: usize,
    pub timeout: usize,
}

impl Stats {
    fn slot(&mut self, state: JobState) -> Option<&mut usize> {
        match state {
            JobState::New => None,
            JobState::Depend => Some(&mut self.depend),
            JobState::Priority => Some(&mut self.priority),
            JobState::Sched => Some(&mut self.sched),
            JobState::Run => Some(&mut self.run),
            JobState::Cleanup => Some(&mut self.cleanup),
            JobState::Inactive => Some(&mut self.inactive),
        }
    }

    pub fn update(&mut self, old: JobState, new: JobState) {
        if let Some(slot) = self.slot(old) {
            *slot = slot.saturating_sub(1);
        }
        if let Some(slot) = self.slot(new) {
            *slot += 1;
        }
    }

    pub fn record_result(&mut self, result: JobResult) {
        match result {
            JobResult::Completed => self.successful += 1,
            JobResult::Failed => self.failed += 1,
            JobResult::Canceled => self.canceled += 1,
            JobResult::Timeout => self.timeout += 1,
        }
    }

    /// Jobs currently in a pre-run state.
    pub fn pending(&self) -> usize {
        self.depend + self.priority + self.sched
    }
}
