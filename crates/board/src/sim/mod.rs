//! Simulation runtime.
//!
//! Loads firmware, holds the context the execution thread owns and runs the
//! step loop on its own thread.

/// Simulation context, shared state and machine hooks.
pub mod context;

/// Firmware image loading (ELF, Intel HEX, raw binary).
pub mod loader;

/// Execution thread and its teardown.
pub mod runner;

pub use context::{MachineHooks, SharedState, ShutdownReport, SimContext};
pub use loader::{FirmwareImage, load_firmware};
pub use runner::{ExecutionHandle, ExitReport, spawn};
