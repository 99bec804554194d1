//! # Unit Components
//!
//! One suite per harness component, plus the reference core and loader the
//! other suites build on.

/// Control surface commands, refresh tick and key map.
pub mod control;

/// Remote-debug request handling and the TCP endpoint.
pub mod debug;





/// Execution thread lifecycle and teardown.
pub mod runner;


/// Trace sessions and the VCD format.
pub mod trace;
