//! Common types shared by every part of the harness.
//!
//! This module provides:
//! 1. **Signals:** Strongly typed signal-line identifiers and value-change records.
//! 2. **Errors:** The error taxonomy for startup and steady-state failures.

/// Error types for storage, loading, machine creation, tracing and debugging.
pub mod error;

/// Signal-line identifiers and change records.
pub mod signal;

pub use error::{
    DebugProtocolError, HarnessError, LoadError, MachineCreationError, StorageError, TraceError,
};
pub use signal::{SignalChange, SignalDriver, SignalId};
