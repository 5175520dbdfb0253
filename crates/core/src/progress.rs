//! Monotonic progress counter for long-running tiled work.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f32 / self.total as f32).clamp(0.0, 1.0)
    }
}

type Listener = Box<dyn FnMut(ProgressSnapshot) + Send>;

/// Counts completed units out of a total fixed at construction.
///
/// Not synchronized: callers sharing one reporter across threads must
/// serialize calls to [`ProgressReporter::advance`]. Advancing past the
/// total is tolerated and only logged.
pub struct ProgressReporter {
    current: u64,
    total: u64,
    overrun_logged: bool,
    listener: Option<Listener>,
}

impl ProgressReporter {
    pub fn new(total: u64) -> Self {
        Self {
            current: 0,
            total,
            overrun_logged: false,
            listener: None,
        }
    }

    pub fn with_listener<F>(total: u64, listener: F) -> Self
    where
        F: FnMut(ProgressSnapshot) + Send + 'static,
    {
        Self {
            listener: Some(Box::new(listener)),
            ..Self::new(total)
        }
    }

    pub fn advance(&mut self, units: u64) {
        self.current = self.current.saturating_add(units);

        if self.current > self.total && !self.overrun_logged {
            self.overrun_logged = true;
            debug!(
                current = self.current,
                total = self.total,
                "Progress advanced past declared total"
            );
        }

        let snapshot = self.snapshot();
        if let Some(listener) = self.listener.as_mut() {
            listener(snapshot);
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            current: self.current,
            total: self.total,
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("current", &self.current)
            .field("total", &self.total)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
