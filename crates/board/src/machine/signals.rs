//! Signal-value bank.
//!
//! The execution thread stores every signal change here; the control thread
//! reads per-signal snapshots without blocking. Each value is an independent
//! atomic, so a read is never torn, but a multi-signal snapshot may mix values
//! from neighbouring steps.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::SignalId;

/// Last-observed values of every signal line of a machine.
#[derive(Debug)]
pub struct SignalBank {
    names: &'static [&'static str],
    values: Box<[AtomicU32]>,
}

impl SignalBank {
    /// Creates a bank for the given signal table, all values zero.
    pub fn new(names: &'static [&'static str]) -> Self {
        Self {
            names,
            values: names.iter().map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Number of signal lines.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the machine has no signal lines.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Signal names in id order.
    pub const fn names(&self) -> &'static [&'static str] {
        self.names
    }

    /// Name of a signal.
    pub fn name(&self, id: SignalId) -> Option<&'static str> {
        self.names.get(id.index()).copied()
    }

    /// Resolves a signal name.
    pub fn lookup(&self, name: &str) -> Option<SignalId> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| SignalId(i as u16))
    }

    /// Current value of a signal; unknown ids read as 0.
    pub fn load(&self, id: SignalId) -> u32 {
        self.values
            .get(id.index())
            .map_or(0, |v| v.load(Ordering::Acquire))
    }

    /// Stores a new value and returns the previous one.
    ///
    /// Returns `None` for unknown ids. Only the execution thread calls this.
    pub fn swap(&self, id: SignalId, value: u32) -> Option<u32> {
        self.values
            .get(id.index())
            .map(|v| v.swap(value, Ordering::AcqRel))
    }

    /// Best-effort copy of every value, in id order.
    pub fn snapshot(&self) -> Vec<u32> {
        self.values
            .iter()
            .map(|v| v.load(Ordering::Acquire))
            .collect()
    }
}
