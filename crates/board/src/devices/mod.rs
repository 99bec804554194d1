//! Peripheral models attached to the machine's signal lines.
//!
//! The core types here are:
//! - [`Peripheral`]: A model that reacts to signal changes and polls host-side input.
//! - [`DeviceRegistry`]: Binds models to signal lines and dispatches changes to them.
//!
//! This module also provides the board's models:
//! - [`Button`]: Push button fed by a pending-event counter.
//! - [`Thermistor`]: Temperature sensor on an ADC channel.
//! - [`UartBridge`]: Serial bridge between UART0 and a host stream.

/// Push button model.
pub mod button;

/// Device attachment registry.
pub mod registry;

/// Thermistor model.
pub mod thermistor;

/// UART host bridge.
pub mod uart_bridge;

use std::sync::{Arc, Mutex};

use crate::common::{SignalChange, SignalDriver};

pub use button::{Button, InputHandle};
pub use registry::{BindingId, DeviceRegistry};
pub use thermistor::Thermistor;
pub use uart_bridge::UartBridge;

/// A peripheral model bound to one or more signal lines.
///
/// All methods run on the execution thread, inline with stepping, and must
/// not block or do unbounded work.
pub trait Peripheral: Send {
    /// Short name for logs (e.g., `"button"`, `"thermistor0"`).
    fn name(&self) -> &str;

    /// Called when a bound signal changes value.
    ///
    /// Drives issued through `io` are applied after the current dispatch
    /// round, never re-entrantly.
    fn on_signal_changed(&mut self, change: SignalChange, io: &mut dyn SignalDriver) {
        let _ = (change, io);
    }

    /// Called once per step before the core executes; picks up host-side input.
    fn poll(&mut self, io: &mut dyn SignalDriver) {
        let _ = io;
    }

    /// Releases host resources (streams, bridges). Called once at shutdown.
    fn teardown(&mut self) {}
}

/// A peripheral shared between the registry's bindings.
pub type SharedPeripheral = Arc<Mutex<dyn Peripheral>>;

/// Wraps a model so it can be attached to several signal lines.
pub fn shared<P: Peripheral + 'static>(model: P) -> SharedPeripheral {
    Arc::new(Mutex::new(model))
}
