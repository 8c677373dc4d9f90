//! Bounded debug line buffer.
//!
//! When enabled, transport and session log lines are captured during an
//! extraction; at save time the joined text lands in the shot record's
//! `debug_log` column. The buffer is a ring capped at [`MAX_LINES`] so a
//! chatty connection cannot grow memory without bound.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum retained lines.
pub const MAX_LINES: usize = 2000;

/// Thread-safe bounded line buffer.
#[derive(Debug, Default)]
pub struct DebugLogBuffer {
    inner: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    lines: VecDeque<String>,
    enabled: bool,
}

impl DebugLogBuffer {
    /// Create a disabled, empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable capture. Disabling clears the buffer.
    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.enabled = enabled;
            if !enabled {
                state.lines.clear();
            }
        }
    }

    /// Whether capture is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().map(|s| s.enabled).unwrap_or(false)
    }

    /// Append one line when enabled, evicting the oldest over the cap.
    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            if !state.enabled {
                return;
            }
            if state.lines.len() == MAX_LINES {
                state.lines.pop_front();
            }
            state.lines.push_back(line.into());
        }
    }

    /// Join and clear the captured lines (called at shot save).
    #[must_use]
    pub fn take_text(&self) -> String {
        match self.inner.lock() {
            Ok(mut state) => {
                let lines: Vec<String> = state.lines.drain(..).collect();
                lines.join("\n")
            },
            Err(_) => String::new(),
        }
    }
}
