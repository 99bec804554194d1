//! Simulation context.
//!
//! [`SimContext`] is the explicit object the harness builds at startup and
//! hands to the execution thread: it owns the machine, the installed hooks
//! (persistent flash among them), the device registry and the optional debug
//! link. [`SharedState`] is the narrow part other threads may touch: run-state,
//! signal values, counters, input handles, the trace gateway and the quit flag.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::common::{LoadError, SignalChange, SignalDriver, SignalId, StorageError};
use crate::config::{ButtonConfig, ThermistorConfig, TraceConfig};
use crate::debug::gdb::{self, DebugGateway, DebugLink, DebugReply, DebugRequest, SRAM_BASE, StopEvent, signal};
use crate::debug::{TraceGateway, TraceSettings};
use crate::devices::{
    self, BindingId, Button, DeviceRegistry, InputHandle, SharedPeripheral, Thermistor, UartBridge,
};
use crate::machine::{AtomicRunState, Machine, RunState, SignalBank};
use crate::sim::loader::FirmwareImage;
use crate::sim::runner::RunGate;

/// Dispatch rounds allowed for peripherals reacting to each other's drives.
const MAX_SETTLE_ROUNDS: usize = 64;

/// Hooks run around the machine's lifetime.
///
/// `init` runs once when the hook is installed, before the first step;
/// `deinit` runs once inside the execution thread's teardown, on every exit path.
pub trait MachineHooks: Send {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Prepares the machine; an error aborts startup.
    fn init(&mut self, machine: &mut Machine) -> Result<(), StorageError>;

    /// Releases or persists state at shutdown; an error is logged and reported.
    fn deinit(&mut self, machine: &Machine) -> Result<(), StorageError>;
}

/// State shared between the execution thread and the control side.
#[derive(Debug)]
pub struct SharedState {
    state: Arc<AtomicRunState>,
    signals: Arc<SignalBank>,
    cycles: AtomicU64,
    steps: AtomicU64,
    quit: AtomicBool,
    finished: AtomicBool,
    debug_attached: AtomicBool,
    gate: RunGate,
    trace: TraceGateway,
    inputs: Mutex<Vec<(String, InputHandle)>>,
    debug_endpoint: Mutex<Option<SocketAddr>>,
    /// Outcome of a teardown no caller received (the thread unwound).
    unclaimed_shutdown: Mutex<Option<ShutdownReport>>,
}

impl SharedState {
    fn new(machine: &Machine, trace: TraceSettings) -> Self {
        let signals = Arc::clone(machine.signals());
        Self {
            state: machine.state_handle(),
            trace: TraceGateway::new(Arc::clone(&signals), trace),
            signals,
            cycles: AtomicU64::new(machine.cycles()),
            steps: AtomicU64::new(0),
            quit: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            debug_attached: AtomicBool::new(false),
            gate: RunGate::new(),
            inputs: Mutex::new(Vec::new()),
            debug_endpoint: Mutex::new(None),
            unclaimed_shutdown: Mutex::new(None),
        }
    }

    /// Current run-state of the machine.
    pub fn run_state(&self) -> RunState {
        self.state.load()
    }

    /// Last-observed signal values.
    pub fn signals(&self) -> &SignalBank {
        &self.signals
    }

    /// Machine cycles as of the last completed step.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Steps executed so far.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// The trace gateway.
    pub const fn trace(&self) -> &TraceGateway {
        &self.trace
    }

    /// Asks the execution thread to finish. Idempotent; never blocks.
    pub fn request_quit(&self) {
        if !self.quit.swap(true, Ordering::AcqRel) {
            info!("quit requested");
        }
        self.gate.notify();
    }

    /// True once quit was requested.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// True once the execution thread has completed its teardown.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// True while a remote debugger session is attached.
    pub fn is_debug_attached(&self) -> bool {
        self.debug_attached.load(Ordering::Acquire)
    }

    /// Moves a stopped machine back to running.
    ///
    /// Refused while a debugger is attached; the debugger owns resumption then.
    pub fn resume(&self) -> bool {
        if self.is_debug_attached() {
            return false;
        }
        let resumed = self.state.transition(RunState::Stopped, RunState::Running);
        if resumed {
            self.gate.notify();
        }
        resumed
    }

    /// Input handle registered under `name`.
    pub fn input(&self, name: &str) -> Option<InputHandle> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h.clone())
    }

    /// Registers an input handle the control surface can inject into.
    pub fn register_input(&self, name: &str, handle: InputHandle) {
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        inputs.retain(|(n, _)| n != name);
        inputs.push((name.to_string(), handle));
    }

    /// Address of the open GDB endpoint, if one was opened.
    pub fn debug_endpoint(&self) -> Option<SocketAddr> {
        *self.debug_endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_debug_endpoint(&self, addr: SocketAddr) {
        *self.debug_endpoint.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
    }

    pub(crate) fn keep_shutdown_report(&self, report: ShutdownReport) {
        *self.unclaimed_shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    pub(crate) fn take_shutdown_report(&self) -> Option<ShutdownReport> {
        self.unclaimed_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) const fn gate(&self) -> &RunGate {
        &self.gate
    }

    pub(crate) fn wake(&self) {
        self.gate.notify();
    }
}

/// Signal access handed to the core and to peripherals during a step.
///
/// A drive that changes a value is stored in the bank, appended to the open
/// trace session and queued for dispatch, in that order.
struct StepIo<'a> {
    bank: &'a SignalBank,
    trace: &'a TraceGateway,
    pending: &'a mut VecDeque<SignalChange>,
    cycles: u64,
}

impl SignalDriver for StepIo<'_> {
    fn read(&self, id: SignalId) -> u32 {
        self.bank.load(id)
    }

    fn drive(&mut self, id: SignalId, value: u32) {
        let Some(old) = self.bank.swap(id, value) else {
            return;
        };
        if old != value {
            let change = SignalChange { id, old, new: value };
            self.trace.record(self.cycles, change);
            self.pending.push_back(change);
        }
    }

    fn lookup(&self, name: &str) -> Option<SignalId> {
        self.bank.lookup(name)
    }
}

/// Outcome of the teardown sequence.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Hooks whose deinit ran.
    pub hooks_run: usize,
    /// Deinit failures, in hook order.
    pub deinit_failures: Vec<StorageError>,
    /// Peripheral models torn down.
    pub torn_down: usize,
}

/// Everything the execution thread owns.
pub struct SimContext {
    machine: Machine,
    registry: Arc<DeviceRegistry>,
    hooks: Vec<Box<dyn MachineHooks>>,
    shared: Arc<SharedState>,
    debug: Option<DebugLink>,
    crash_debug_port: Option<u16>,
    crash_gateway: Option<DebugGateway>,
    pending: VecDeque<SignalChange>,
    shut_down: bool,
}

impl std::fmt::Debug for SimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimContext")
            .field("machine", &self.machine)
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("debug", &self.debug.is_some())
            .finish_non_exhaustive()
    }
}

impl SimContext {
    /// Wraps a configured machine; trace sessions follow `trace`.
    pub fn new(machine: Machine, trace: &TraceConfig) -> Self {
        let settings = TraceSettings {
            path: trace.path.clone(),
            signals: trace.signals.clone(),
            frequency: machine.frequency(),
        };
        let shared = Arc::new(SharedState::new(&machine, settings));
        let registry = Arc::new(DeviceRegistry::new(machine.signals().len()));
        Self {
            machine,
            registry,
            hooks: Vec::new(),
            shared,
            debug: None,
            crash_debug_port: None,
            crash_gateway: None,
            pending: VecDeque::new(),
            shut_down: false,
        }
    }

    /// Runs `hook.init` now and keeps the hook for shutdown.
    ///
    /// A failing init is returned and the hook is dropped without deinit.
    pub fn install_hook(&mut self, mut hook: Box<dyn MachineHooks>) -> Result<(), StorageError> {
        hook.init(&mut self.machine)?;
        debug!(hook = hook.name(), "hook installed");
        self.hooks.push(hook);
        Ok(())
    }

    /// Copies a firmware image into flash.
    pub fn load_program(&mut self, image: &FirmwareImage) -> Result<(), LoadError> {
        self.machine.load_program(image)
    }

    /// The machine.
    pub const fn machine(&self) -> &Machine {
        &self.machine
    }

    /// The machine, mutably (before spawning).
    pub const fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    /// The device registry.
    pub const fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Handle to the cross-thread state.
    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Binds a model to a named signal line.
    pub fn attach_peripheral(&self, signal: &str, model: &SharedPeripheral) -> Option<BindingId> {
        let Some(id) = self.machine.signals().lookup(signal) else {
            warn!(signal, "no such signal line; peripheral not attached");
            return None;
        };
        self.registry.attach(id, model)
    }

    /// Attaches a push button and registers its input under the configured name.
    pub fn attach_button(&self, config: &ButtonConfig) -> Option<InputHandle> {
        let button = Button::new(config.name.clone(), config.signal.clone(), config.bit);
        let handle = button.handle();
        if self.machine.signals().lookup(&config.signal).is_none() {
            warn!(signal = %config.signal, "no such signal line; button not attached");
            return None;
        }
        self.registry.track(&devices::shared(button));
        self.shared.register_input(&config.name, handle.clone());
        Some(handle)
    }

    /// Attaches a thermistor to `ADMUX`.
    ///
    /// Refused while the machine's ADC rails are unpowered.
    pub fn attach_thermistor(&self, config: &ThermistorConfig) -> Option<BindingId> {
        let rails = self.machine.rails();
        if !rails.powers_adc() {
            warn!(
                avcc_mv = rails.avcc_mv,
                aref_mv = rails.aref_mv,
                "ADC rails unpowered; thermistor not attached"
            );
            return None;
        }
        let model = devices::shared(Thermistor::with_table(
            config.adc_channel,
            devices::thermistor::SEMITEC_104GT,
            config.oversample,
            config.temperature,
        ));
        self.attach_peripheral("ADMUX", &model)
    }

    /// Attaches the UART0 bridge writing to `output`.
    ///
    /// Returns the sender host bytes for `UART0.RX` go into.
    pub fn attach_uart(&self, output: Box<dyn Write + Send>) -> Option<Sender<u8>> {
        let (bridge, input) = UartBridge::new(output);
        let model = devices::shared(bridge);
        self.attach_peripheral("UART0.TX", &model)?;
        Some(input)
    }

    /// Attaches a debug session: the machine starts Stopped and waits for it.
    pub fn attach_debugger(&mut self, link: DebugLink) {
        self.debug = Some(link);
        self.machine.set_run_state(RunState::Stopped);
        self.shared.debug_attached.store(true, Ordering::Release);
        info!("machine stopped, waiting for debugger");
    }

    /// Opens a debug endpoint on `port` if the machine crashes without one.
    pub const fn set_crash_debug_port(&mut self, port: Option<u16>) {
        self.crash_debug_port = port;
    }

    /// Executes one step: peripheral polling, one core step, change dispatch.
    ///
    /// Returns the state the core reported.
    pub fn step(&mut self) -> RunState {
        let cycles = self.machine.cycles();
        {
            let mut io = StepIo {
                bank: &self.shared.signals,
                trace: &self.shared.trace,
                pending: &mut self.pending,
                cycles,
            };
            self.registry.poll_all(&mut io);
        }
        self.settle(cycles);

        let reported = {
            let mut io = StepIo {
                bank: &self.shared.signals,
                trace: &self.shared.trace,
                pending: &mut self.pending,
                cycles,
            };
            self.machine.step_core(&mut io)
        };
        self.settle(cycles);

        self.shared
            .cycles
            .store(self.machine.cycles(), Ordering::Relaxed);
        let _ = self.shared.steps.fetch_add(1, Ordering::Relaxed);
        reported
    }

    /// Dispatches queued changes until peripherals stop driving new ones.
    fn settle(&mut self, cycles: u64) {
        let mut rounds = 0;
        while !self.pending.is_empty() {
            if rounds == MAX_SETTLE_ROUNDS {
                warn!(dropped = self.pending.len(), "signal changes did not settle");
                self.pending.clear();
                return;
            }
            rounds += 1;
            let batch: Vec<SignalChange> = self.pending.drain(..).collect();
            let mut io = StepIo {
                bank: &self.shared.signals,
                trace: &self.shared.trace,
                pending: &mut self.pending,
                cycles,
            };
            for change in batch {
                self.registry.dispatch(change, &mut io);
            }
        }
    }

    /// Stores the state a step produced, applying debug-session rules.
    ///
    /// With a debugger attached a crash stops the machine instead of ending
    /// the run. Returns the state the execution loop acts on.
    pub(crate) fn apply_step_result(&mut self, reported: RunState) -> RunState {
        match reported {
            RunState::Running => {
                if let Some(link) = self.debug.as_mut() {
                    if link.take_stepping() {
                        self.machine.set_run_state(RunState::Stopped);
                        link.notify(StopEvent::Signal(signal::SIGTRAP));
                        return RunState::Stopped;
                    }
                }
                RunState::Running
            }
            RunState::Stopped => {
                self.machine.set_run_state(RunState::Stopped);
                if let Some(link) = self.debug.as_mut() {
                    let _ = link.take_stepping();
                    link.notify(StopEvent::Signal(signal::SIGTRAP));
                }
                debug!(pc = self.machine.pc(), "machine stopped");
                RunState::Stopped
            }
            RunState::Crashed => {
                if self.debug.is_none() {
                    self.open_crash_debugger();
                }
                if let Some(link) = self.debug.as_mut() {
                    let _ = link.take_stepping();
                    link.notify(StopEvent::Signal(signal::SIGSEGV));
                    self.machine.set_run_state(RunState::Stopped);
                    warn!(pc = self.machine.pc(), "machine crashed; stopped for debugger");
                    return RunState::Stopped;
                }
                self.machine.set_run_state(RunState::Crashed);
                warn!(pc = self.machine.pc(), "machine crashed");
                RunState::Crashed
            }
            RunState::Done => {
                self.machine.set_run_state(RunState::Done);
                if let Some(link) = self.debug.as_ref() {
                    link.notify(StopEvent::Exited(0));
                }
                info!(cycles = self.machine.cycles(), "machine done");
                RunState::Done
            }
        }
    }

    fn open_crash_debugger(&mut self) {
        let Some(port) = self.crash_debug_port.take() else {
            return;
        };
        let (link, client) = gdb::channel();
        match DebugGateway::spawn(port, client, Arc::clone(&self.shared)) {
            Ok(gateway) => {
                self.crash_gateway = Some(gateway);
                self.debug = Some(link);
                self.shared.debug_attached.store(true, Ordering::Release);
            }
            Err(e) => warn!(error = %e, "cannot open debugger on crash"),
        }
    }

    /// True (and the machine is stopped) if a breakpoint sits at the PC.
    pub(crate) fn check_breakpoint(&mut self) -> bool {
        let pc = self.machine.pc();
        let Some(link) = self.debug.as_mut() else {
            return false;
        };
        if !link.should_break(pc) {
            return false;
        }
        self.machine.set_run_state(RunState::Stopped);
        link.notify(StopEvent::Signal(signal::SIGTRAP));
        debug!(pc, "breakpoint hit");
        true
    }

    /// Services every pending debugger request.
    pub(crate) fn service_debug(&mut self) {
        let mut detach = false;
        while let Some(link) = self.debug.as_mut() {
            let command = match link.try_next() {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(()) => {
                    detach = true;
                    break;
                }
            };
            let reply = match command.request {
                DebugRequest::ReadRegisters => {
                    let core = self.machine.core();
                    let mut bytes = core.registers().to_vec();
                    bytes.extend_from_slice(&core.pc().to_le_bytes());
                    DebugReply::Data(bytes)
                }
                DebugRequest::ReadRegister(n) => {
                    let core = self.machine.core();
                    let regs = core.registers();
                    match n.cmp(&regs.len()) {
                        std::cmp::Ordering::Less => DebugReply::Data(vec![regs[n]]),
                        std::cmp::Ordering::Equal => DebugReply::Data(core.pc().to_le_bytes().to_vec()),
                        std::cmp::Ordering::Greater => DebugReply::Error,
                    }
                }
                DebugRequest::WriteRegister { index, value } => {
                    if write_debug_register(&mut self.machine, index, &value) {
                        DebugReply::Ok
                    } else {
                        DebugReply::Error
                    }
                }
                DebugRequest::ReadMemory { addr, len } => read_debug_memory(&self.machine, addr, len)
                    .map_or(DebugReply::Error, DebugReply::Data),
                DebugRequest::WriteMemory { addr, data } => {
                    if write_debug_memory(&mut self.machine, addr, &data) {
                        DebugReply::Ok
                    } else {
                        DebugReply::Error
                    }
                }
                DebugRequest::InsertBreakpoint(addr) => {
                    link.set_breakpoint(addr, true);
                    DebugReply::Ok
                }
                DebugRequest::RemoveBreakpoint(addr) => {
                    link.set_breakpoint(addr, false);
                    DebugReply::Ok
                }
                request @ (DebugRequest::Continue | DebugRequest::Step) => {
                    if self.machine.run_state().is_terminal() {
                        DebugReply::Error
                    } else {
                        let step = request == DebugRequest::Step;
                        link.resume_from(self.machine.pc(), step);
                        self.machine.set_run_state(RunState::Running);
                        DebugReply::Resumed
                    }
                }
                DebugRequest::Interrupt => {
                    if self.machine.run_state() == RunState::Running {
                        self.machine.set_run_state(RunState::Stopped);
                        link.notify(StopEvent::Signal(signal::SIGINT));
                    }
                    DebugReply::Ok
                }
                DebugRequest::Kill => {
                    self.shared.request_quit();
                    DebugReply::Ok
                }
                DebugRequest::Detach => {
                    detach = true;
                    DebugReply::Ok
                }
            };
            let _ = command.reply.send(reply);
            if detach {
                break;
            }
        }

        if detach {
            self.debug = None;
            self.shared.debug_attached.store(false, Ordering::Release);
            let _ = self
                .machine
                .state_handle()
                .transition(RunState::Stopped, RunState::Running);
            info!("debugger detached; machine running");
        }
    }

    /// True once [`SimContext::shutdown`] has run.
    pub const fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Runs the teardown sequence once: hook deinit (flash save), peripheral
    /// teardown, trace close. Later calls return an empty report.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport::default();
        }
        self.shut_down = true;
        info!(state = %self.machine.run_state(), "shutting down");

        let mut report = ShutdownReport::default();
        for mut hook in std::mem::take(&mut self.hooks) {
            report.hooks_run += 1;
            if let Err(e) = hook.deinit(&self.machine) {
                warn!(hook = hook.name(), error = %e, "hook deinit failed");
                report.deinit_failures.push(e);
            }
        }
        report.torn_down = self.registry.teardown_all();
        self.shared.trace.close();
        self.debug = None;
        self.shared.debug_attached.store(false, Ordering::Release);
        self.shared.finished.store(true, Ordering::Release);
        self.shared.wake();

        if let Some(gateway) = self.crash_gateway.take() {
            gateway.join();
        }
        report
    }
}

/// Splits a debugger address into memory region and offset.
fn debug_region(addr: u32) -> (bool, usize) {
    if addr >= SRAM_BASE {
        (true, (addr - SRAM_BASE) as usize)
    } else {
        (false, addr as usize)
    }
}

fn read_debug_memory(machine: &Machine, addr: u32, len: usize) -> Option<Vec<u8>> {
    let (sram, offset) = debug_region(addr);
    let mem = if sram {
        machine.core().sram()
    } else {
        machine.core().flash()
    };
    mem.get(offset..offset.checked_add(len)?).map(<[u8]>::to_vec)
}

/// General registers take one byte; the index past them is the PC (4 bytes LE).
fn write_debug_register(machine: &mut Machine, index: usize, value: &[u8]) -> bool {
    let core = machine.core_mut();
    let count = core.registers().len();
    match (index.cmp(&count), value) {
        (std::cmp::Ordering::Less, [byte]) => core.set_register(index, *byte),
        (std::cmp::Ordering::Equal, [a, b, c, d]) => {
            core.set_pc(u32::from_le_bytes([*a, *b, *c, *d]));
            true
        }
        _ => false,
    }
}

fn write_debug_memory(machine: &mut Machine, addr: u32, data: &[u8]) -> bool {
    let (sram, offset) = debug_region(addr);
    let core = machine.core_mut();
    let mem = if sram { core.sram_mut() } else { core.flash_mut() };
    let Some(end) = offset.checked_add(data.len()) else {
        return false;
    };
    mem.get_mut(offset..end)
        .map(|dst| dst.copy_from_slice(data))
        .is_some()
}
