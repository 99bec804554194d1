//! Device attachment registry.
//!
//! Each signal line owns its own binding list behind a mutex. Dispatching a
//! change holds that line's lock for the whole callback round, so a detach on
//! the same line waits for in-flight callbacks instead of racing them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::common::{SignalChange, SignalDriver, SignalId};
use crate::devices::SharedPeripheral;

/// Handle identifying one binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

struct Binding {
    id: BindingId,
    model: SharedPeripheral,
}

/// Binds peripheral models to signal lines.
pub struct DeviceRegistry {
    lines: Box<[Mutex<Vec<Binding>>]>,
    models: Mutex<Vec<SharedPeripheral>>,
    next_id: AtomicU64,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("lines", &self.lines.len())
            .field("models", &lock(&self.models).len())
            .finish_non_exhaustive()
    }
}

/// Locks a mutex, recovering the data if a callback panicked while holding it.
fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Model identity, ignoring the vtable half of the fat pointer.
fn same_model(a: &SharedPeripheral, b: &SharedPeripheral) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

impl DeviceRegistry {
    /// Creates an empty registry for a machine with `signal_count` lines.
    pub fn new(signal_count: usize) -> Self {
        Self {
            lines: (0..signal_count).map(|_| Mutex::new(Vec::new())).collect(),
            models: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Binds `model` to a signal line.
    ///
    /// Several bindings per line are allowed; their callback order is
    /// unspecified. Returns `None` if the line does not exist.
    pub fn attach(&self, signal: SignalId, model: &SharedPeripheral) -> Option<BindingId> {
        let line = self.lines.get(signal.index())?;
        let id = BindingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(line).push(Binding {
            id,
            model: Arc::clone(model),
        });
        self.track(model);
        debug!(%signal, model = %lock(model).name(), "peripheral attached");
        Some(id)
    }

    /// Registers a model for polling and teardown without binding it to a line.
    pub fn track(&self, model: &SharedPeripheral) {
        let mut models = lock(&self.models);
        if !models.iter().any(|m| same_model(m, model)) {
            models.push(Arc::clone(model));
        }
    }

    /// Removes every binding of `model` on `signal`; returns how many were removed.
    ///
    /// Blocks while a callback round for that line is in flight.
    pub fn detach(&self, signal: SignalId, model: &SharedPeripheral) -> usize {
        let Some(line) = self.lines.get(signal.index()) else {
            return 0;
        };
        let removed = {
            let mut bindings = lock(line);
            let before = bindings.len();
            bindings.retain(|b| !same_model(&b.model, model));
            before - bindings.len()
        };
        if removed > 0 && !self.is_bound(model) {
            lock(&self.models).retain(|m| !same_model(m, model));
        }
        removed
    }

    /// Removes a single binding by handle.
    pub fn detach_binding(&self, id: BindingId) -> bool {
        self.lines.iter().any(|line| {
            let mut bindings = lock(line);
            let before = bindings.len();
            bindings.retain(|b| b.id != id);
            before != bindings.len()
        })
    }

    fn is_bound(&self, model: &SharedPeripheral) -> bool {
        self.lines
            .iter()
            .any(|line| lock(line).iter().any(|b| same_model(&b.model, model)))
    }

    /// Number of bindings on a line.
    pub fn binding_count(&self, signal: SignalId) -> usize {
        self.lines.get(signal.index()).map_or(0, |l| lock(l).len())
    }

    /// Number of distinct models polled each step.
    pub fn model_count(&self) -> usize {
        lock(&self.models).len()
    }

    /// Invokes every callback bound to the changed line.
    pub fn dispatch(&self, change: SignalChange, io: &mut dyn SignalDriver) {
        let Some(line) = self.lines.get(change.id.index()) else {
            return;
        };
        let bindings = lock(line);
        for binding in bindings.iter() {
            lock(&binding.model).on_signal_changed(change, io);
        }
    }

    /// Polls every tracked model once.
    pub fn poll_all(&self, io: &mut dyn SignalDriver) {
        let models: Vec<SharedPeripheral> = lock(&self.models).iter().map(Arc::clone).collect();
        for model in models {
            lock(&model).poll(io);
        }
    }

    /// Detaches every binding and tears every model down exactly once.
    ///
    /// Returns the number of models torn down; a second call returns 0.
    pub fn teardown_all(&self) -> usize {
        for line in &*self.lines {
            lock(line).clear();
        }
        let models = std::mem::take(&mut *lock(&self.models));
        for model in &models {
            let mut guard = lock(model);
            debug!(model = %guard.name(), "tearing down peripheral");
            guard.teardown();
        }
        models.len()
    }
}
