//! Serial bridge between UART0 and the host.
//!
//! Bytes the firmware transmits on `UART0.TX` go to a host writer (the console
//! by default). Host bytes arrive on a channel and are fed to `UART0.RX` one at
//! a time whenever the receive slot is free.
//!
//! Signal conventions:
//! - `UART0.TX`: each change to a non-zero value transmits its low byte; the
//!   firmware returns the line to 0 between bytes.
//! - `UART0.RX`: bit 8 set means a byte is waiting in bits 0..8; the firmware
//!   clears the signal to 0 once it has read the byte.

use std::io::Write;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};

use tracing::{debug, warn};

use crate::common::{SignalChange, SignalDriver};
use crate::devices::Peripheral;

/// `UART0.RX` flag marking a waiting byte.
pub const RX_READY: u32 = 0x100;

/// Threshold for flushing the transmit buffer to the host writer (4 KiB).
const TX_BUFFER_FLUSH_THRESHOLD: usize = 4096;

/// UART0 host bridge.
pub struct UartBridge {
    output: Box<dyn Write + Send>,
    input: Receiver<u8>,
    input_closed: bool,
    tx_buffer: Vec<u8>,
    transmitted: u64,
    received: u64,
}

impl std::fmt::Debug for UartBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartBridge")
            .field("transmitted", &self.transmitted)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl UartBridge {
    /// Creates a bridge writing to `output`.
    ///
    /// Returns the bridge and the sender the host feeds receive bytes into.
    pub fn new(output: Box<dyn Write + Send>) -> (Self, Sender<u8>) {
        let (tx, rx) = channel();
        let bridge = Self {
            output,
            input: rx,
            input_closed: false,
            tx_buffer: Vec::new(),
            transmitted: 0,
            received: 0,
        };
        (bridge, tx)
    }

    /// Bytes transmitted by the firmware so far.
    pub const fn transmitted(&self) -> u64 {
        self.transmitted
    }

    /// Host bytes delivered to the firmware so far.
    pub const fn received(&self) -> u64 {
        self.received
    }

    fn flush_tx(&mut self) {
        if self.tx_buffer.is_empty() {
            return;
        }
        let result = self
            .output
            .write_all(&self.tx_buffer)
            .and_then(|()| self.output.flush());
        if let Err(e) = result {
            warn!(error = %e, "uart bridge write failed");
        }
        self.tx_buffer.clear();
    }
}

impl Peripheral for UartBridge {
    fn name(&self) -> &str {
        "uart0"
    }

    fn on_signal_changed(&mut self, change: SignalChange, io: &mut dyn SignalDriver) {
        if io.lookup("UART0.TX") != Some(change.id) || change.new == 0 {
            return;
        }
        let byte = (change.new & 0xFF) as u8;
        self.tx_buffer.push(byte);
        self.transmitted += 1;
        if byte == b'\n' || self.tx_buffer.len() >= TX_BUFFER_FLUSH_THRESHOLD {
            self.flush_tx();
        }
    }

    fn poll(&mut self, io: &mut dyn SignalDriver) {
        if self.input_closed {
            return;
        }
        let Some(rx) = io.lookup("UART0.RX") else {
            return;
        };
        if io.read(rx) & RX_READY != 0 {
            return;
        }
        match self.input.try_recv() {
            Ok(byte) => {
                self.received += 1;
                io.drive(rx, RX_READY | u32::from(byte));
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                debug!("uart bridge input closed");
                self.input_closed = true;
            }
        }
    }

    fn teardown(&mut self) {
        self.flush_tx();
        debug!(
            transmitted = self.transmitted,
            received = self.received,
            "uart bridge closed"
        );
    }
}
