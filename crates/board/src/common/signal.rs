//! Signal lines.
//!
//! A signal line is a named I/O pin group or port whose value changes are
//! observable by attached peripheral models, trace sessions and the renderer.

use std::fmt;

/// Index of a signal line in the machine's signal table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalId(pub u16);

impl SignalId {
    /// Returns the table index of this signal.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig{}", self.0)
    }
}

/// One observed value change on a signal line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalChange {
    /// Signal that changed.
    pub id: SignalId,
    /// Value before the change.
    pub old: u32,
    /// Value after the change.
    pub new: u32,
}

/// Read/drive access to signal lines.
///
/// Implemented by the execution thread's step context; handed to the machine
/// core while it steps and to peripheral models while they poll or react to
/// a change. Drives that do not alter the value are not changes.
pub trait SignalDriver {
    /// Returns the current value of a signal, or 0 for an unknown id.
    fn read(&self, id: SignalId) -> u32;
    /// Drives a signal to a new value.
    fn drive(&mut self, id: SignalId, value: u32);
    /// Resolves a signal name to its id.
    fn lookup(&self, name: &str) -> Option<SignalId>;
}
