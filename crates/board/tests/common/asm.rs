use mcuboard_core::machine::bytecore::opcodes;
use mcuboard_core::sim::FirmwareImage;

/// Signal ids of the four-port models (`atmega644`, `atmega1284p`).
pub mod sig {
    pub const PORTA: u8 = 0;
    pub const PORTB: u8 = 1;
    pub const PINC: u8 = 6;
    pub const ADMUX: u8 = 8;
    pub const ADC: u8 = 9;
    pub const UART0_TX: u8 = 10;
    pub const UART0_RX: u8 = 11;
}

/// Fluent builder for reference-core programs.
#[derive(Debug, Default, Clone)]
pub struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the next instruction.
    pub fn here(&self) -> u16 {
        self.bytes.len() as u16
    }

    fn emit(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn emit_addr(self, op: u8, r: u8, addr: u16) -> Self {
        let [lo, hi] = addr.to_le_bytes();
        self.emit(&[op, r, lo, hi])
    }

    pub fn nop(self) -> Self {
        self.emit(&[opcodes::NOP])
    }

    pub fn ldi(self, rd: u8, imm: u8) -> Self {
        self.emit(&[opcodes::LDI, rd, imm])
    }

    pub fn addi(self, rd: u8, imm: u8) -> Self {
        self.emit(&[opcodes::ADDI, rd, imm])
    }

    pub fn sts(self, rs: u8, addr: u16) -> Self {
        self.emit_addr(opcodes::STS, rs, addr)
    }

    pub fn lpm(self, rd: u8, addr: u16) -> Self {
        self.emit_addr(opcodes::LPM, rd, addr)
    }

    pub fn spm(self, rs: u8, addr: u16) -> Self {
        self.emit_addr(opcodes::SPM, rs, addr)
    }

    pub fn out(self, port: u8, rs: u8) -> Self {
        self.emit(&[opcodes::OUT, port, rs])
    }

    pub fn in_(self, rd: u8, port: u8) -> Self {
        self.emit(&[opcodes::IN, rd, port])
    }

    pub fn jmp(self, addr: u16) -> Self {
        let [lo, hi] = addr.to_le_bytes();
        self.emit(&[opcodes::JMP, lo, hi])
    }

    pub fn brnz(self, rs: u8, addr: u16) -> Self {
        self.emit_addr(opcodes::BRNZ, rs, addr)
    }

    pub fn brk(self) -> Self {
        self.emit(&[opcodes::BREAK])
    }

    pub fn sleep(self) -> Self {
        self.emit(&[opcodes::SLEEP])
    }

    /// Transmits `text` on UART0, returning TX to idle after each byte.
    pub fn uart_print(self, text: &str) -> Self {
        text.bytes().fold(self, |asm, byte| {
            asm.ldi(7, byte)
                .out(sig::UART0_TX, 7)
                .ldi(7, 0)
                .out(sig::UART0_TX, 7)
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn image(&self) -> FirmwareImage {
        FirmwareImage::raw(self.bytes.clone())
    }
}

/// A program that spins forever.
pub fn spin() -> Asm {
    Asm::new().nop().jmp(0)
}
