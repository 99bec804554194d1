//! Machine-core contract.
//!
//! The harness never decodes instructions itself. Anything that can step a
//! program against a set of signal lines, and expose its PC, registers and
//! memories for the store and the debugger, can be plugged in here.

use crate::common::SignalDriver;
use crate::machine::RunState;

/// Instruction-level simulation core.
pub trait Core: Send {
    /// Program counter (byte address into flash).
    fn pc(&self) -> u32;
    /// Moves the program counter.
    fn set_pc(&mut self, pc: u32);

    /// General-purpose registers, in debugger order.
    fn registers(&self) -> &[u8];
    /// Writes one register; returns `false` for an unknown index.
    fn set_register(&mut self, index: usize, value: u8) -> bool;

    /// Non-volatile program memory.
    fn flash(&self) -> &[u8];
    /// Non-volatile program memory, mutably.
    fn flash_mut(&mut self) -> &mut [u8];
    /// Data memory.
    fn sram(&self) -> &[u8];
    /// Data memory, mutably.
    fn sram_mut(&mut self) -> &mut [u8];

    /// Cycles executed so far.
    fn cycles(&self) -> u64;

    /// Executes one instruction.
    ///
    /// Signal writes go through `io` so the harness can dispatch and trace
    /// them. Returns `Running` to continue, `Stopped` for a software
    /// breakpoint, `Crashed` for an unrecoverable fault or `Done` for a halt.
    fn step(&mut self, io: &mut dyn SignalDriver) -> RunState;
}
