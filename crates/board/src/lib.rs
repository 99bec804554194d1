//! Board harness for simulated 8-bit microcontrollers.
//!
//! This crate runs a machine core on a dedicated execution thread while a control
//! thread issues commands and renders the observable pins. It provides:
//! 1. **Machine:** The machine-core contract, run-state, model table and a reference core.
//! 2. **Storage:** Persistent flash backed by a flat file, loaded at start and saved at exit.
//! 3. **Devices:** The signal-line attachment registry plus button, thermistor and UART models.
//! 4. **Simulation:** Firmware loading, the simulation context and the execution thread.
//! 5. **Debug:** VCD trace sessions and a GDB remote-serial-protocol gateway.
//! 6. **Control:** Interactive commands and the periodic refresh tick.

/// Common types (signal identifiers, signal changes, error taxonomy).
pub mod common;
/// Harness configuration (defaults, hierarchical config structures).
pub mod config;
/// Control surface (commands, refresh tick, render boundary).
pub mod control;
/// Trace sessions and the remote-debug gateway.
pub mod debug;
/// Device attachment registry and peripheral models.
pub mod devices;
/// Machine-core contract, run-state and the built-in reference core.
pub mod machine;
/// Firmware loading, simulation context and the execution thread.
pub mod sim;
/// Persistent memory store for the simulated flash.
pub mod storage;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Simulated processor instance owned by the execution thread.
pub use crate::machine::{Machine, RunState};
/// Explicit context handed to the execution thread at startup.
pub use crate::sim::context::SimContext;
