//! Trace and remote-debug control plane.
//!
//! This module groups the two optional ways to observe a running machine:
//! 1. **Trace:** VCD recording of signal changes, started and stopped at runtime.
//! 2. **Remote debug:** A GDB remote-serial-protocol endpoint that can pause, step and
//!    inspect the machine through requests the execution thread services.

/// GDB gateway thread and the request/stop channels.
pub mod gdb;

/// Remote serial protocol packet codec.
pub mod rsp;

/// VCD trace sessions.
pub mod trace;

pub use gdb::{DebugClient, DebugGateway, DebugLink, DebugReply, DebugRequest, StopEvent};
pub use trace::{TraceGateway, TraceSession, TraceSettings};
