//! Control surface.
//!
//! The control side of the harness. It provides:
//! 1. **Commands:** Quit, inject input, start/stop trace and resume, each safe to call
//!    from any thread while the execution thread steps.
//! 2. **Refresh tick:** A best-effort [`Frame`] of the last-observed signals, taken
//!    without ever waiting on the execution thread.
//! 3. **Keys:** The interactive key map (`q`/ESC, space, `r`, `s`).

/// Render boundary.
pub mod render;

use std::sync::Arc;

use tracing::{info, warn};

use crate::common::TraceError;
use crate::machine::RunState;
use crate::sim::SharedState;

pub use render::{NullRenderer, Renderer, TextDashboard};

/// Escape key.
const ESC: char = '\u{1b}';

/// Input name the space key injects into unless configured otherwise.
pub const BUTTON_INPUT: &str = "button";

/// True for keys [`ControlSurface::handle_key`] acts on.
pub const fn is_command_key(key: char) -> bool {
    matches!(key, 'q' | ESC | ' ' | 'r' | 's')
}

/// Snapshot rendered on each refresh tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Run-state at the time of the snapshot.
    pub state: RunState,
    /// Machine cycles executed.
    pub cycles: u64,
    /// Steps executed.
    pub steps: u64,
    /// Signal names and values, in id order.
    pub signals: Vec<(&'static str, u32)>,
    /// A trace session is open.
    pub tracing: bool,
    /// A remote debugger is attached.
    pub debugging: bool,
}

/// Result of a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Quit was requested.
    Quit,
    /// An input event was injected.
    Injected,
    /// A trace session was opened.
    TraceStarted,
    /// The trace session was closed.
    TraceStopped,
    /// The key did nothing (unmapped, or the command was a no-op).
    Ignored,
}

/// Commands and refresh tick of a running harness.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    shared: Arc<SharedState>,
    button: String,
}

impl ControlSurface {
    /// Creates a control surface over the execution thread's shared state.
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            button: BUTTON_INPUT.to_string(),
        }
    }

    /// Points the space key at the input registered as `name`.
    #[must_use]
    pub fn with_button_input(mut self, name: impl Into<String>) -> Self {
        self.button = name.into();
        self
    }

    /// The shared state this surface drives.
    pub const fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Requests termination and returns at once.
    ///
    /// The execution thread finishes its current step, then saves and tears
    /// down; join it to wait for that. Calling this again is harmless.
    pub fn quit(&self) {
        self.shared.request_quit();
    }

    /// Records one input event for the named input.
    ///
    /// Returns the pending count, or `None` if no input has that name.
    pub fn inject_input(&self, name: &str) -> Option<u32> {
        let handle = self.shared.input(name)?;
        Some(handle.inject())
    }

    /// Opens a trace session on the configured file.
    pub fn start_trace(&self) -> Result<(), TraceError> {
        self.shared.trace().start(self.shared.cycles())
    }

    /// Closes the trace session; returns the number of recorded changes.
    pub fn stop_trace(&self) -> Result<u64, TraceError> {
        self.shared.trace().stop()
    }

    /// Resumes a machine stopped without a debugger (e.g., by a `BREAK`).
    pub fn resume(&self) -> bool {
        self.shared.resume()
    }

    /// True once the execution thread has finished its teardown.
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Takes a best-effort snapshot for rendering. Never blocks.
    pub fn tick(&self) -> Frame {
        let bank = self.shared.signals();
        let signals = bank
            .names()
            .iter()
            .copied()
            .zip(bank.snapshot())
            .collect();
        Frame {
            state: self.shared.run_state(),
            cycles: self.shared.cycles(),
            steps: self.shared.steps(),
            signals,
            tracing: self.shared.trace().is_active(),
            debugging: self.shared.is_debug_attached(),
        }
    }

    /// Applies the interactive key map.
    pub fn handle_key(&self, key: char) -> KeyAction {
        match key {
            'q' | ESC => {
                self.quit();
                KeyAction::Quit
            }
            ' ' => match self.inject_input(&self.button) {
                Some(_) => KeyAction::Injected,
                None => KeyAction::Ignored,
            },
            'r' => match self.start_trace() {
                Ok(()) => {
                    info!(path = %self.shared.trace().settings().path.display(), "starting VCD trace");
                    KeyAction::TraceStarted
                }
                Err(TraceError::AlreadyActive) => {
                    info!("trace already active");
                    KeyAction::Ignored
                }
                Err(e) => {
                    warn!(error = %e, "cannot start trace");
                    KeyAction::Ignored
                }
            },
            's' => match self.stop_trace() {
                Ok(records) => {
                    info!(records, "stopped VCD trace");
                    KeyAction::TraceStopped
                }
                Err(TraceError::NotActive) => KeyAction::Ignored,
                Err(e) => {
                    warn!(error = %e, "cannot stop trace");
                    KeyAction::Ignored
                }
            },
            _ => KeyAction::Ignored,
        }
    }
}
