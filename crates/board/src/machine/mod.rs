//! Machine definition and creation.
//!
//! This module defines the `Machine` container the execution thread owns while
//! running. It coordinates the following:
//! 1. **Run-state:** The single field read across threads, stored atomically.
//! 2. **Models:** The static table of known targets (flash/SRAM size, signal lines).
//! 3. **Core:** The instruction-level collaborator behind the `Core` trait.
//! 4. **Signals:** The shared bank of last-observed signal values.

/// Machine-core contract.
pub mod core;

/// Built-in deterministic byte-code reference core.
pub mod bytecore;

/// Static table of known target models.
pub mod model;

/// Shared signal-value bank.
pub mod signals;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use crate::common::{LoadError, MachineCreationError, SignalDriver};
use crate::sim::loader::FirmwareImage;

pub use self::bytecore::ByteCore;
pub use self::core::Core;
pub use self::model::{ModelSpec, find_model};
pub use self::signals::SignalBank;

/// Run-state of the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunState {
    /// Stepping normally.
    Running = 0,
    /// Suspended; the execution thread waits for a resume.
    Stopped = 1,
    /// Unrecoverable fault reported by the core.
    Crashed = 2,
    /// Normal halt reported by the core.
    Done = 3,
}

impl RunState {
    /// `Crashed` and `Done` end the execution thread's loop.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Done)
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Stopped,
            2 => Self::Crashed,
            _ => Self::Done,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Done => "done",
        })
    }
}

/// Run-state cell shared between the execution thread and its observers.
#[derive(Debug)]
pub struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    /// Creates a cell holding `state`.
    pub const fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Reads the current state.
    pub fn load(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Overwrites the current state.
    pub fn store(&self, state: RunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to` only if the state is still `from`.
    ///
    /// Returns `false` if another thread changed the state first; terminal
    /// states are never overwritten by a pause or resume this way.
    pub fn transition(&self, from: RunState, to: RunState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Supply and reference rails in millivolts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rails {
    /// Digital supply.
    pub vcc_mv: u32,
    /// Analog supply.
    pub avcc_mv: u32,
    /// ADC reference.
    pub aref_mv: u32,
}

impl Rails {
    /// True if the ADC has both its analog supply and a reference.
    pub const fn powers_adc(self) -> bool {
        self.avcc_mv > 0 && self.aref_mv > 0
    }
}

impl Default for Rails {
    fn default() -> Self {
        Self {
            vcc_mv: 5000,
            avcc_mv: 5000,
            aref_mv: 5000,
        }
    }
}

/// The simulated processor instance.
///
/// Exclusively owned by the execution thread while running; only the run-state
/// and the signal bank are shared, through `Arc`s handed out before spawning.
pub struct Machine {
    model: &'static ModelSpec,
    core: Box<dyn Core>,
    frequency: u32,
    rails: Rails,
    signals: Arc<SignalBank>,
    state: Arc<AtomicRunState>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("model", &self.model.name)
            .field("pc", &self.core.pc())
            .field("frequency", &self.frequency)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Creates a machine for a known model using the built-in reference core.
pub fn create(model_name: &str) -> Result<Machine, MachineCreationError> {
    let model = find_model(model_name)
        .ok_or_else(|| MachineCreationError::UnknownModel(model_name.to_string()))?;
    debug!(model = model.name, flash = model.flash_size, "creating machine");
    Ok(Machine::with_core(model, Box::new(ByteCore::new(model))))
}

impl Machine {
    /// Wraps an arbitrary core implementing the contract for `model`.
    pub fn with_core(model: &'static ModelSpec, core: Box<dyn Core>) -> Self {
        Self {
            model,
            core,
            frequency: 1_000_000,
            rails: Rails::default(),
            signals: Arc::new(SignalBank::new(model.signals)),
            state: Arc::new(AtomicRunState::new(RunState::Running)),
        }
    }

    /// Sets the clock frequency and supply rails.
    pub fn configure(&mut self, frequency: u32, rails: Rails) {
        self.frequency = frequency.max(1);
        self.rails = rails;
    }

    /// Copies a firmware image into flash and points the PC at its base.
    pub fn load_program(&mut self, image: &FirmwareImage) -> Result<(), LoadError> {
        let flash = self.core.flash_mut();
        let start = image.base as usize;
        let end = start + image.data.len();
        if end > flash.len() {
            return Err(LoadError::OutOfRange {
                base: image.base,
                end: end as u64,
                flash_size: flash.len(),
            });
        }
        flash[start..end].copy_from_slice(&image.data);
        self.core.set_pc(image.base);
        debug!(base = image.base, bytes = image.data.len(), "program loaded");
        Ok(())
    }

    /// Target model of this machine.
    pub const fn model(&self) -> &'static ModelSpec {
        self.model
    }

    /// Clock frequency in Hz.
    pub const fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Supply and reference rails.
    pub const fn rails(&self) -> Rails {
        self.rails
    }

    /// Program counter.
    pub fn pc(&self) -> u32 {
        self.core.pc()
    }

    /// Cycles executed so far.
    pub fn cycles(&self) -> u64 {
        self.core.cycles()
    }

    /// Simulated non-volatile memory.
    pub fn flash(&self) -> &[u8] {
        self.core.flash()
    }

    /// Mutable simulated non-volatile memory.
    pub fn flash_mut(&mut self) -> &mut [u8] {
        self.core.flash_mut()
    }

    /// The machine core.
    pub fn core(&self) -> &dyn Core {
        self.core.as_ref()
    }

    /// The machine core, mutably.
    pub fn core_mut(&mut self) -> &mut dyn Core {
        self.core.as_mut()
    }

    /// Current run-state.
    pub fn run_state(&self) -> RunState {
        self.state.load()
    }

    /// Overwrites the run-state.
    pub fn set_run_state(&self, state: RunState) {
        self.state.store(state);
    }

    /// Shared handle to the run-state cell.
    pub fn state_handle(&self) -> Arc<AtomicRunState> {
        Arc::clone(&self.state)
    }

    /// Shared handle to the signal bank.
    pub const fn signals(&self) -> &Arc<SignalBank> {
        &self.signals
    }

    /// Executes one core step against `io`.
    pub(crate) fn step_core(&mut self, io: &mut dyn SignalDriver) -> RunState {
        self.core.step(io)
    }
}
