//! Error taxonomy.
//!
//! Startup errors (`StorageError` at load time, `LoadError`, `MachineCreationError`)
//! abort the process with a non-zero exit status. Steady-state errors
//! (`TraceError`, `DebugProtocolError`) stay local to the command or channel
//! that caused them and never stop the execution thread. The machine's own
//! terminal states are not errors at all.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of the persistent memory store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing file could not be created or opened.
    #[error("cannot open backing file {path}: {source}")]
    Open {
        /// Backing file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A fresh backing file could not be extended to the declared size.
    #[error("cannot size backing file {path} to {size} bytes: {source}")]
    Resize {
        /// Backing file path.
        path: PathBuf,
        /// Declared memory size.
        size: u64,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An existing backing file does not match the declared memory size.
    #[error("backing file {path} holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Backing file path.
        path: PathBuf,
        /// Declared memory size.
        expected: u64,
        /// Length found on disk.
        actual: u64,
    },

    /// Fewer bytes than the declared size could be read back.
    #[error("short read from {path}: got {read} of {expected} bytes")]
    ShortRead {
        /// Backing file path.
        path: PathBuf,
        /// Bytes actually read.
        read: usize,
        /// Declared memory size.
        expected: usize,
    },

    /// Fewer bytes than the image size could be written.
    #[error("short write to {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Backing file path.
        path: PathBuf,
        /// Bytes actually written.
        written: usize,
        /// Image size.
        expected: usize,
    },

    /// Any other I/O failure while reading or writing the image.
    #[error("I/O error on backing file {path}: {source}")]
    Io {
        /// Backing file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Failure to read or parse a firmware image.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The firmware file could not be read.
    #[error("cannot read firmware {path}: {source}")]
    Io {
        /// Firmware path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The file is empty or in no recognised format.
    #[error("unsupported firmware format in {0}")]
    UnsupportedFormat(PathBuf),

    /// An Intel HEX record is malformed.
    #[error("malformed HEX record on line {line}: {reason}")]
    MalformedHex {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// The ELF container could not be parsed.
    #[error("malformed ELF image: {0}")]
    Elf(String),

    /// The image does not fit in the target's flash.
    #[error("image spans {base:#x}..{end:#x} but flash holds {flash_size:#x} bytes")]
    OutOfRange {
        /// First byte address of the image.
        base: u32,
        /// One past the last byte address of the image.
        end: u64,
        /// Flash size of the target model.
        flash_size: usize,
    },
}

/// Failure to instantiate a machine core.
#[derive(Debug, Error)]
pub enum MachineCreationError {
    /// No model with this name is known to the core.
    #[error("unknown machine model '{0}'")]
    UnknownModel(String),
}

/// Misuse of the trace start/stop commands.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A trace session is already open.
    #[error("a trace session is already active")]
    AlreadyActive,
    /// No trace session is open.
    #[error("no trace session is active")]
    NotActive,
    /// The execution thread has finished; tracing is over.
    #[error("tracing is closed: the execution thread has finished")]
    Closed,
    /// The trace sink could not be opened or written.
    #[error("trace sink error: {0}")]
    Sink(#[from] io::Error),
}

/// A malformed or unsupported remote-debug packet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DebugProtocolError {
    /// The packet is not framed as `$payload#checksum`.
    #[error("malformed packet framing")]
    Framing,
    /// The checksum does not match the payload.
    #[error("checksum mismatch: expected {expected:02x}, got {actual:02x}")]
    Checksum {
        /// Checksum computed over the payload.
        expected: u8,
        /// Checksum carried by the packet.
        actual: u8,
    },
    /// The command is recognised but an argument is invalid.
    #[error("bad argument in '{0}' packet")]
    BadArgument(char),
    /// The execution thread is gone and cannot answer.
    #[error("target is no longer running")]
    Detached,
}

/// Umbrella for startup failures; every variant aborts the process.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The persistent memory store failed to load.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The firmware image failed to load.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// The machine core could not be created.
    #[error(transparent)]
    Machine(#[from] MachineCreationError),
    /// The configuration file could not be read or parsed.
    #[error("invalid configuration {path}: {reason}")]
    Config {
        /// Configuration path.
        path: PathBuf,
        /// Parse or I/O failure description.
        reason: String,
    },
    /// The remote-debug endpoint could not be opened.
    #[error("cannot open debug endpoint on port {port}: {source}")]
    DebugEndpoint {
        /// TCP port requested.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The execution thread could not be spawned.
    #[error("cannot spawn execution thread: {0}")]
    Spawn(#[source] io::Error),
}
