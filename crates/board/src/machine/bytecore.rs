//! Byte-code reference core.
//!
//! A small deterministic core that lets the harness run end to end without an
//! external instruction-set simulator. Every instruction takes one cycle.
//!
//! # Encoding
//!
//! Operands follow the opcode byte; addresses are 16-bit little-endian.
//!
//! | Opcode | Mnemonic | Operands            | Effect                          |
//! |--------|----------|---------------------|---------------------------------|
//! | `0x00` | NOP      |                     |                                 |
//! | `0x10` | LDI      | rd, imm             | rd = imm                        |
//! | `0x11` | MOV      | rd, rs              | rd = rs                         |
//! | `0x12` | ADDI     | rd, imm             | rd = rd + imm (wrapping)        |
//! | `0x20` | LDS      | rd, addr            | rd = sram\[addr\]               |
//! | `0x21` | STS      | rs, addr            | sram\[addr\] = rs               |
//! | `0x22` | LPM      | rd, addr            | rd = flash\[addr\]              |
//! | `0x23` | SPM      | rs, addr            | flash\[addr\] = rs              |
//! | `0x30` | OUT      | port, rs            | drive signal `port` with rs     |
//! | `0x31` | IN       | rd, port            | rd = low byte of signal `port`  |
//! | `0x40` | JMP      | addr                | pc = addr                       |
//! | `0x41` | BRZ      | rs, addr            | pc = addr if rs == 0            |
//! | `0x42` | BRNZ     | rs, addr            | pc = addr if rs != 0            |
//! | `0x98` | BREAK    |                     | stop (software breakpoint)      |
//! | `0xF0` | SLEEP    |                     | halt (done)                     |
//!
//! Any other opcode, an out-of-range register, address or PC crashes the core.

use crate::common::{SignalDriver, SignalId};
use crate::machine::{Core, ModelSpec, RunState};

/// Number of general-purpose registers.
pub const REGISTER_COUNT: usize = 8;

/// Opcode bytes of the reference core.
pub mod opcodes {
    /// No operation.
    pub const NOP: u8 = 0x00;
    /// Load immediate.
    pub const LDI: u8 = 0x10;
    /// Register move.
    pub const MOV: u8 = 0x11;
    /// Add immediate.
    pub const ADDI: u8 = 0x12;
    /// Load from SRAM.
    pub const LDS: u8 = 0x20;
    /// Store to SRAM.
    pub const STS: u8 = 0x21;
    /// Load from flash.
    pub const LPM: u8 = 0x22;
    /// Store to flash (self-programming).
    pub const SPM: u8 = 0x23;
    /// Drive a signal.
    pub const OUT: u8 = 0x30;
    /// Sample a signal.
    pub const IN: u8 = 0x31;
    /// Unconditional jump.
    pub const JMP: u8 = 0x40;
    /// Branch if zero.
    pub const BRZ: u8 = 0x41;
    /// Branch if not zero.
    pub const BRNZ: u8 = 0x42;
    /// Software breakpoint.
    pub const BREAK: u8 = 0x98;
    /// Halt.
    pub const SLEEP: u8 = 0xF0;
}

/// The reference core's architectural state.
#[derive(Debug, Clone)]
pub struct ByteCore {
    pc: u32,
    regs: [u8; REGISTER_COUNT],
    flash: Vec<u8>,
    sram: Vec<u8>,
    cycles: u64,
}

/// Why an instruction could not complete.
enum Fault {
    Crash,
}

impl ByteCore {
    /// Creates a core sized for `model`; flash starts zero-filled.
    pub fn new(model: &ModelSpec) -> Self {
        Self {
            pc: 0,
            regs: [0; REGISTER_COUNT],
            flash: vec![0; model.flash_size],
            sram: vec![0; model.sram_size],
            cycles: 0,
        }
    }

    fn fetch(&self, offset: u32) -> Result<u8, Fault> {
        self.flash
            .get((self.pc + offset) as usize)
            .copied()
            .ok_or(Fault::Crash)
    }

    fn fetch_addr(&self, offset: u32) -> Result<u16, Fault> {
        Ok(u16::from_le_bytes([self.fetch(offset)?, self.fetch(offset + 1)?]))
    }

    fn reg(&self, index: u8) -> Result<u8, Fault> {
        self.regs.get(index as usize).copied().ok_or(Fault::Crash)
    }

    fn reg_mut(&mut self, index: u8) -> Result<&mut u8, Fault> {
        self.regs.get_mut(index as usize).ok_or(Fault::Crash)
    }

    fn branch(&mut self, taken: bool, target: u16, len: u32) {
        self.pc = if taken { u32::from(target) } else { self.pc + len };
    }

    fn execute(&mut self, io: &mut dyn SignalDriver) -> Result<RunState, Fault> {
        use opcodes::{
            ADDI, BREAK, BRNZ, BRZ, IN, JMP, LDI, LDS, LPM, MOV, NOP, OUT, SLEEP, SPM, STS,
        };

        let op = self.fetch(0)?;
        match op {
            NOP => self.pc += 1,
            LDI => {
                let imm = self.fetch(2)?;
                *self.reg_mut(self.fetch(1)?)? = imm;
                self.pc += 3;
            }
            MOV => {
                let value = self.reg(self.fetch(2)?)?;
                *self.reg_mut(self.fetch(1)?)? = value;
                self.pc += 3;
            }
            ADDI => {
                let imm = self.fetch(2)?;
                let rd = self.reg_mut(self.fetch(1)?)?;
                *rd = rd.wrapping_add(imm);
                self.pc += 3;
            }
            LDS | LPM => {
                let addr = self.fetch_addr(2)? as usize;
                let mem = if op == LDS { &self.sram } else { &self.flash };
                let value = *mem.get(addr).ok_or(Fault::Crash)?;
                *self.reg_mut(self.fetch(1)?)? = value;
                self.pc += 4;
            }
            STS | SPM => {
                let value = self.reg(self.fetch(1)?)?;
                let addr = self.fetch_addr(2)? as usize;
                let mem = if op == STS {
                    &mut self.sram
                } else {
                    &mut self.flash
                };
                *mem.get_mut(addr).ok_or(Fault::Crash)? = value;
                self.pc += 4;
            }
            OUT => {
                let port = SignalId(u16::from(self.fetch(1)?));
                let value = self.reg(self.fetch(2)?)?;
                io.drive(port, u32::from(value));
                self.pc += 3;
            }
            IN => {
                let port = SignalId(u16::from(self.fetch(2)?));
                *self.reg_mut(self.fetch(1)?)? = (io.read(port) & 0xFF) as u8;
                self.pc += 3;
            }
            JMP => self.pc = u32::from(self.fetch_addr(1)?),
            BRZ | BRNZ => {
                let value = self.reg(self.fetch(1)?)?;
                let target = self.fetch_addr(2)?;
                self.branch((value == 0) == (op == BRZ), target, 4);
            }
            BREAK => {
                self.pc += 1;
                return Ok(RunState::Stopped);
            }
            SLEEP => return Ok(RunState::Done),
            _ => return Err(Fault::Crash),
        }
        Ok(RunState::Running)
    }
}

impl Core for ByteCore {
    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn registers(&self) -> &[u8] {
        &self.regs
    }

    fn set_register(&mut self, index: usize, value: u8) -> bool {
        self.regs.get_mut(index).map(|r| *r = value).is_some()
    }

    fn flash(&self) -> &[u8] {
        &self.flash
    }

    fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    fn sram(&self) -> &[u8] {
        &self.sram
    }

    fn sram_mut(&mut self) -> &mut [u8] {
        &mut self.sram
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }

    fn step(&mut self, io: &mut dyn SignalDriver) -> RunState {
        self.cycles += 1;
        match self.execute(io) {
            Ok(state) => state,
            Err(Fault::Crash) => RunState::Crashed,
        }
    }
}
