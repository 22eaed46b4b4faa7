use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    Staging,
    Profile,
    Compressing,
    Validating,
    Extracting,
    Replaying,
    Purging,
    Cleanup,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Staging => "staging",
            Phase::Profile => "profile",
            Phase::Compressing => "compressing",
            Phase::Validating => "validating",
            Phase::Extracting => "extracting",
            Phase::Replaying => "replaying",
            Phase::Purging => "purging",
            Phase::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub item: Option<String>,
    pub fraction: f32,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

pub type CancelFlag = Arc<AtomicBool>;

/// Pushes `(phase, item, fraction)` snapshots to an optional callback and
/// polls the cooperative cancel flag between file-level steps.
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    cancel: Option<CancelFlag>,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>, cancel: Option<CancelFlag>) -> Self {
        Self { callback, cancel }
    }

    pub fn silent() -> Self {
        Self {
            callback: None,
            cancel: None,
        }
    }

    pub fn report(&self, phase: Phase, current: usize, total: usize, item: Option<String>) {
        let Some(callback) = &self.callback else {
            return;
        };
        let total = total.max(1);
        let current = current.min(total);
        callback(ProgressEvent {
            phase,
            item,
            fraction: current as f32 / total as f32,
        });
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}
