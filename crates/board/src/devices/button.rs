//! Push button.
//!
//! The control thread never touches the button model directly. It bumps a
//! pending-event counter through an [`InputHandle`]; the model takes the whole
//! count on its next poll and replays one press/release pair per event on its
//! pin, active low.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::trace;

use crate::common::{SignalDriver, SignalId};
use crate::devices::Peripheral;

/// Cross-thread side of a button: inject events, read back the observed count.
#[derive(Clone, Debug, Default)]
pub struct InputHandle {
    pending: Arc<AtomicU32>,
    observed: Arc<AtomicU64>,
}

impl InputHandle {
    /// Creates a handle with no pending events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one input event; returns the pending count including it.
    ///
    /// Safe to call from any thread, concurrently with stepping.
    pub fn inject(&self) -> u32 {
        self.pending.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Events injected but not yet taken by a poll.
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Events taken by the model so far.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }

    /// Takes every pending event at once.
    fn take(&self) -> u32 {
        let n = self.pending.swap(0, Ordering::AcqRel);
        self.observed.fetch_add(u64::from(n), Ordering::AcqRel);
        n
    }
}

/// Push button wired to one bit of a signal line.
#[derive(Debug)]
pub struct Button {
    name: String,
    signal_name: String,
    mask: u32,
    signal: Option<SignalId>,
    handle: InputHandle,
    queued: u64,
    pressed: bool,
    presses: u64,
}

impl Button {
    /// Creates a button on `bit` of the named signal.
    ///
    /// # Arguments
    ///
    /// * `name` - Input name the control surface routes injections by.
    /// * `signal` - Signal line carrying the button's pin (e.g., `"PINC"`).
    /// * `bit` - Pin bit within that signal; reads low while pressed.
    pub fn new(name: impl Into<String>, signal: impl Into<String>, bit: u8) -> Self {
        Self {
            name: name.into(),
            signal_name: signal.into(),
            mask: 1 << (bit & 31),
            signal: None,
            handle: InputHandle::new(),
            queued: 0,
            pressed: false,
            presses: 0,
        }
    }

    /// Handle the control thread injects events through.
    pub fn handle(&self) -> InputHandle {
        self.handle.clone()
    }

    /// Presses replayed on the pin so far.
    pub const fn presses(&self) -> u64 {
        self.presses
    }

    fn set_pin(&self, io: &mut dyn SignalDriver, id: SignalId, level: bool) {
        let value = io.read(id);
        let value = if level { value | self.mask } else { value & !self.mask };
        io.drive(id, value);
    }
}

impl Peripheral for Button {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, io: &mut dyn SignalDriver) {
        let id = match self.signal {
            Some(id) => id,
            None => {
                let Some(id) = io.lookup(&self.signal_name) else {
                    return;
                };
                self.signal = Some(id);
                self.set_pin(io, id, true);
                id
            }
        };

        self.queued += u64::from(self.handle.take());

        if self.pressed {
            self.set_pin(io, id, true);
            self.pressed = false;
        } else if self.queued > 0 {
            self.queued -= 1;
            self.presses += 1;
            self.set_pin(io, id, false);
            self.pressed = true;
            trace!(button = %self.name, presses = self.presses, "button press");
        }
    }
}
