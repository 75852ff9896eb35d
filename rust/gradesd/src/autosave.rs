use serde::Serialize;
#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;
use std::time::Instant;

pub const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 30_000;
pub const DEFAULT_SAVED_DISPLAY_MS: u64 = 3_000;

/// Monotonic milliseconds. The daemon uses wall time, tests drive it by hand.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSaveStatus {
    Idle,
    Saving,
    Saved,
    Error,
}

/// Single debounce timer plus the save indicator.
///
/// `arm` always replaces the previous deadline. `error` stays until the next
/// successful save; `saved` falls back to `idle` after the display window.
#[derive(Debug, Clone)]
pub struct AutoSaveScheduler {
    delay_ms: u64,
    saved_display_ms: u64,
    deadline: Option<u64>,
    status: AutoSaveStatus,
    saved_until: Option<u64>,
}

impl AutoSaveScheduler {
    pub fn new(delay_ms: u64, saved_display_ms: u64) -> Self {
        AutoSaveScheduler {
            delay_ms,
            saved_display_ms,
            deadline: None,
            status: AutoSaveStatus::Idle,
            saved_until: None,
        }
    }

    pub fn status(&self) -> AutoSaveStatus {
        self.status
    }

    pub fn arm(&mut self, now: u64) {
        self.deadline = Some(now.saturating_add(self.delay_ms));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Consumes the deadline when it has passed.
    pub fn take_due(&mut self, now: u64) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn mark_saving(&mut self) {
        self.status = AutoSaveStatus::Saving;
        self.saved_until = None;
    }

    pub fn mark_saved(&mut self, now: u64) {
        self.status = AutoSaveStatus::Saved;
        self.saved_until = Some(now.saturating_add(self.saved_display_ms));
    }

    pub fn mark_failed(&mut self) {
        self.status = AutoSaveStatus::Error;
        self.saved_until = None;
    }

    /// Reverts `saved` to `idle` once its display window is over.
    pub fn poll(&mut self, now: u64) {
        if let Some(until) = self.saved_until {
            if now >= until {
                self.saved_until = None;
                if self.status == AutoSaveStatus::Saved {
                    self.status = AutoSaveStatus::Idle;
                }
            }
        }
    }

    /// Earliest instant at which `take_due` or `poll` would change something.
    pub fn next_wake(&self) -> Option<u64> {
        match (self.deadline, self.saved_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
