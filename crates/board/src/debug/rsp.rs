//! GDB remote serial protocol codec.
//!
//! Splits the byte stream from a debugger into acknowledgements, interrupts
//! and `$payload#checksum` packets, and parses packet payloads into commands.

use std::fmt::Write as _;

use crate::common::DebugProtocolError;

/// Out-of-band interrupt byte (Ctrl-C).
pub const INTERRUPT: u8 = 0x03;

/// Payload length advertised in `qSupported`.
pub const PACKET_SIZE: usize = 0x1000;

/// One unit received from the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// `+`
    Ack,
    /// `-`; the last reply should be sent again.
    Nack,
    /// Ctrl-C outside a packet.
    Interrupt,
    /// A packet with a valid checksum.
    Packet(String),
    /// A packet that failed framing or checksum validation.
    Malformed(DebugProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Payload,
    Checksum1,
    Checksum2(u8),
}

/// Incremental packet decoder.
#[derive(Debug)]
pub struct PacketReader {
    state: State,
    payload: Vec<u8>,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    /// Creates a decoder waiting for the next packet.
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            payload: Vec::new(),
        }
    }

    /// Feeds one byte; returns a unit once one is complete.
    pub fn push(&mut self, byte: u8) -> Option<Incoming> {
        match self.state {
            State::Idle => match byte {
                b'+' => Some(Incoming::Ack),
                b'-' => Some(Incoming::Nack),
                INTERRUPT => Some(Incoming::Interrupt),
                b'$' => {
                    self.payload.clear();
                    self.state = State::Payload;
                    None
                }
                _ => None,
            },
            State::Payload => match byte {
                b'#' => {
                    self.state = State::Checksum1;
                    None
                }
                b'$' => {
                    self.payload.clear();
                    Some(Incoming::Malformed(DebugProtocolError::Framing))
                }
                _ if self.payload.len() >= PACKET_SIZE => {
                    self.state = State::Idle;
                    Some(Incoming::Malformed(DebugProtocolError::Framing))
                }
                _ => {
                    self.payload.push(byte);
                    None
                }
            },
            State::Checksum1 => {
                self.state = State::Checksum2(byte);
                None
            }
            State::Checksum2(hi) => {
                self.state = State::Idle;
                Some(self.finish(hi, byte))
            }
        }
    }

    fn finish(&mut self, hi: u8, lo: u8) -> Incoming {
        let Some(actual) = hex_pair(hi, lo) else {
            return Incoming::Malformed(DebugProtocolError::Framing);
        };
        let expected = checksum(&self.payload);
        if actual != expected {
            return Incoming::Malformed(DebugProtocolError::Checksum { expected, actual });
        }
        let payload = unescape(&self.payload);
        match String::from_utf8(payload) {
            Ok(text) => Incoming::Packet(text),
            Err(_) => Incoming::Malformed(DebugProtocolError::Framing),
        }
    }
}

/// Modulo-256 sum of the payload bytes.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Frames a reply payload as `$payload#cs`.
pub fn encode(payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    for &b in payload.as_bytes() {
        if matches!(b, b'$' | b'#' | b'}' | b'*') {
            out.extend_from_slice(&[b'}', b ^ 0x20]);
        } else {
            out.push(b);
        }
    }
    let sum = checksum(&out[1..]);
    out.push(b'#');
    out.extend_from_slice(format!("{sum:02x}").as_bytes());
    out
}

fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b == b'}' {
            if let Some(&next) = bytes.next() {
                out.push(next ^ 0x20);
            }
        } else {
            out.push(b);
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    char::from(b).to_digit(16).map(|d| d as u8)
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    Some(hex_digit(hi)? << 4 | hex_digit(lo)?)
}

/// Lower-case hex encoding of `bytes`.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Decodes an even-length hex string.
pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    let bytes = text.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes.chunks(2).map(|p| hex_pair(p[0], p[1])).collect()
}

/// A decoded debugger command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `?`
    HaltReason,
    /// `g`
    ReadRegisters,
    /// `p n`
    ReadRegister(usize),
    /// `P n=value`
    WriteRegister {
        /// Register number.
        index: usize,
        /// Target-order value bytes.
        value: Vec<u8>,
    },
    /// `m addr,len`
    ReadMemory {
        /// Debugger address.
        addr: u32,
        /// Byte count.
        len: usize,
    },
    /// `M addr,len:data`
    WriteMemory {
        /// Debugger address.
        addr: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// `c`
    Continue,
    /// `s`
    Step,
    /// `Z0,addr,kind`
    InsertBreakpoint(u32),
    /// `z0,addr,kind`
    RemoveBreakpoint(u32),
    /// `k`
    Kill,
    /// `D`
    Detach,
    /// `qSupported`
    QuerySupported,
    /// `qAttached`
    QueryAttached,
    /// Anything else; answered with the empty reply.
    Unsupported,
}

fn parse_hex_u32(text: &str, cmd: char) -> Result<u32, DebugProtocolError> {
    u32::from_str_radix(text, 16).map_err(|_| DebugProtocolError::BadArgument(cmd))
}

impl Command {
    /// Parses a packet payload.
    pub fn parse(payload: &str) -> Result<Self, DebugProtocolError> {
        let Some(cmd) = payload.chars().next() else {
            return Ok(Self::Unsupported);
        };
        let args = &payload[cmd.len_utf8()..];
        let cmd_err = DebugProtocolError::BadArgument(cmd);

        let command = match cmd {
            '?' => Self::HaltReason,
            'g' => Self::ReadRegisters,
            'p' => Self::ReadRegister(parse_hex_u32(args, cmd)? as usize),
            'P' => {
                let (index, value) = args.split_once('=').ok_or(cmd_err.clone())?;
                Self::WriteRegister {
                    index: parse_hex_u32(index, cmd)? as usize,
                    value: from_hex(value).filter(|v| !v.is_empty()).ok_or(cmd_err)?,
                }
            }
            'm' => {
                let (addr, len) = args.split_once(',').ok_or(cmd_err)?;
                let len = parse_hex_u32(len, cmd)? as usize;
                if len > PACKET_SIZE / 2 {
                    return Err(DebugProtocolError::BadArgument(cmd));
                }
                Self::ReadMemory {
                    addr: parse_hex_u32(addr, cmd)?,
                    len,
                }
            }
            'M' => {
                let (head, data) = args.split_once(':').ok_or(cmd_err.clone())?;
                let (addr, len) = head.split_once(',').ok_or(cmd_err.clone())?;
                let data = from_hex(data).ok_or(cmd_err)?;
                if data.len() != parse_hex_u32(len, cmd)? as usize {
                    return Err(DebugProtocolError::BadArgument(cmd));
                }
                Self::WriteMemory {
                    addr: parse_hex_u32(addr, cmd)?,
                    data,
                }
            }
            'c' => Self::Continue,
            's' => Self::Step,
            'Z' | 'z' => {
                let mut parts = args.split(',');
                let kind = parts.next().ok_or(cmd_err.clone())?;
                let addr = parts.next().ok_or(cmd_err)?;
                if kind != "0" {
                    return Ok(Self::Unsupported);
                }
                let addr = parse_hex_u32(addr, cmd)?;
                if cmd == 'Z' {
                    Self::InsertBreakpoint(addr)
                } else {
                    Self::RemoveBreakpoint(addr)
                }
            }
            'k' => Self::Kill,
            'D' => Self::Detach,
            'q' if args.starts_with("Supported") => Self::QuerySupported,
            'q' if args.starts_with("Attached") => Self::QueryAttached,
            _ => Self::Unsupported,
        };
        Ok(command)
    }
}
