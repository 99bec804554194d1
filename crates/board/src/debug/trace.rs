//! VCD trace sessions.
//!
//! A session streams signal changes to a Value Change Dump file:
//! - Header: timescale, one `$var` per monitored signal, initial `$dumpvars`.
//! - Body: `#<time>` stamps (nanoseconds derived from cycles and clock) and value changes.
//!
//! [`TraceGateway`] holds at most one open session. The control thread opens
//! and closes it; the execution thread appends to it inline with stepping.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::common::{SignalChange, TraceError};
use crate::machine::SignalBank;

/// Output buffer of a streaming session.
const SINK_BUFFER: usize = 64 * 1024;

/// Where and what a trace session records.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// VCD file, truncated when a session starts.
    pub path: PathBuf,
    /// Signal names to monitor; empty monitors every signal.
    pub signals: Vec<String>,
    /// Machine clock in Hz, used to turn cycles into time stamps.
    pub frequency: u32,
}

/// Bit width a signal is dumped with.
fn signal_width(name: &str) -> u32 {
    match name {
        "ADC" => 10,
        "UART0.RX" => 9,
        _ => 8,
    }
}

/// Short VCD identifier for a signal index (printable ASCII from `!`).
fn vcd_id(index: usize) -> String {
    const BASE: usize = 94;
    let mut n = index;
    let mut id = String::new();
    loop {
        id.insert(0, char::from(b'!' + (n % BASE) as u8));
        n /= BASE;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    id
}

struct Var {
    id: String,
    width: u32,
}

/// One open trace session.
pub struct TraceSession {
    sink: BufWriter<Box<dyn Write + Send>>,
    vars: Vec<Option<Var>>,
    frequency: u64,
    last_time: Option<u64>,
    records: u64,
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("monitored", &self.vars.iter().flatten().count())
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl TraceSession {
    /// Opens a session on `sink` and writes the VCD header.
    ///
    /// # Arguments
    ///
    /// * `sink` - Output stream of the session.
    /// * `bank` - Signal table and current values (the initial dump).
    /// * `monitored` - Names to record; empty records every signal, unknown names are skipped.
    /// * `frequency` - Machine clock in Hz.
    /// * `cycles` - Current cycle count, the time of the initial dump.
    pub fn open(
        sink: Box<dyn Write + Send>,
        bank: &SignalBank,
        monitored: &[String],
        frequency: u32,
        cycles: u64,
    ) -> io::Result<Self> {
        let vars = bank
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (monitored.is_empty() || monitored.iter().any(|m| m == name)).then(|| Var {
                    id: vcd_id(i),
                    width: signal_width(name),
                })
            })
            .collect();

        let mut session = Self {
            sink: BufWriter::with_capacity(SINK_BUFFER, sink),
            vars,
            frequency: u64::from(frequency.max(1)),
            last_time: None,
            records: 0,
        };
        session.write_header(bank, cycles)?;
        Ok(session)
    }

    fn write_header(&mut self, bank: &SignalBank, cycles: u64) -> io::Result<()> {
        let w = &mut self.sink;
        writeln!(w, "$timescale 1ns $end")?;
        writeln!(w, "$scope module board $end")?;
        for (name, var) in bank.names().iter().zip(&self.vars) {
            if let Some(var) = var {
                let safe = name.replace('.', "_");
                writeln!(w, "$var wire {} {} {} $end", var.width, var.id, safe)?;
            }
        }
        writeln!(w, "$upscope $end")?;
        writeln!(w, "$enddefinitions $end")?;

        let time = self.time_of(cycles);
        writeln!(self.sink, "#{time}")?;
        writeln!(self.sink, "$dumpvars")?;
        let values = bank.snapshot();
        for (value, var) in values.iter().zip(&self.vars) {
            if let Some(var) = var {
                write_value(&mut self.sink, var, *value)?;
            }
        }
        writeln!(self.sink, "$end")?;
        self.last_time = Some(time);
        Ok(())
    }

    fn time_of(&self, cycles: u64) -> u64 {
        (u128::from(cycles) * 1_000_000_000 / u128::from(self.frequency)) as u64
    }

    /// True if changes on this signal are recorded.
    pub fn monitors(&self, change: &SignalChange) -> bool {
        matches!(self.vars.get(change.id.index()), Some(Some(_)))
    }

    /// Appends one change observed at `cycles`; unmonitored signals are skipped.
    pub fn record(&mut self, cycles: u64, change: SignalChange) -> io::Result<()> {
        let Some(Some(var)) = self.vars.get(change.id.index()) else {
            return Ok(());
        };
        let time = self.time_of(cycles);
        if self.last_time != Some(time) {
            writeln!(self.sink, "#{time}")?;
            self.last_time = Some(time);
        }
        write_value(&mut self.sink, var, change.new)?;
        self.records += 1;
        Ok(())
    }

    /// Flushes and closes the sink; returns the number of changes recorded.
    pub fn close(mut self) -> io::Result<u64> {
        self.sink.flush()?;
        Ok(self.records)
    }
}

fn write_value(w: &mut impl Write, var: &Var, value: u32) -> io::Result<()> {
    let mask = if var.width >= 32 {
        u32::MAX
    } else {
        (1 << var.width) - 1
    };
    writeln!(
        w,
        "b{:0width$b} {}",
        value & mask,
        var.id,
        width = var.width as usize
    )
}

/// Session slot guarded by the gateway lock.
#[derive(Default)]
struct Slot {
    session: Option<TraceSession>,
    /// A start is opening its sink outside the lock.
    starting: bool,
    /// The execution thread has finished; no session may open again.
    sealed: bool,
}

/// Start/stop/record front of the single trace session.
pub struct TraceGateway {
    active: AtomicBool,
    slot: Mutex<Slot>,
    bank: Arc<SignalBank>,
    settings: TraceSettings,
}

impl std::fmt::Debug for TraceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceGateway")
            .field("active", &self.is_active())
            .field("path", &self.settings.path)
            .finish_non_exhaustive()
    }
}

impl TraceGateway {
    /// Creates an inactive gateway over `bank`.
    pub fn new(bank: Arc<SignalBank>, settings: TraceSettings) -> Self {
        Self {
            active: AtomicBool::new(false),
            slot: Mutex::new(Slot::default()),
            bank,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settings new sessions are opened with.
    pub const fn settings(&self) -> &TraceSettings {
        &self.settings
    }

    /// True while a session is open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Opens a session on the configured VCD file.
    ///
    /// Fails with [`TraceError::AlreadyActive`] without touching the file
    /// when a session is already open.
    pub fn start(&self, cycles: u64) -> Result<(), TraceError> {
        let path = self.settings.path.clone();
        self.start_with(cycles, || {
            File::create(&path).map(|f| Box::new(f) as Box<dyn Write + Send>)
        })?;
        info!(path = %self.settings.path.display(), "trace started");
        Ok(())
    }

    /// Opens a session on the sink produced by `open_sink`.
    ///
    /// `open_sink` only runs when no session is open or opening, and the
    /// gateway is not closed. The sink is opened and the header written
    /// without holding the lock the execution thread records under.
    pub fn start_with<F>(&self, cycles: u64, open_sink: F) -> Result<(), TraceError>
    where
        F: FnOnce() -> io::Result<Box<dyn Write + Send>>,
    {
        {
            let mut slot = self.lock();
            if slot.sealed {
                return Err(TraceError::Closed);
            }
            if slot.session.is_some() || slot.starting {
                return Err(TraceError::AlreadyActive);
            }
            slot.starting = true;
        }

        let opened = open_sink().and_then(|sink| {
            TraceSession::open(
                sink,
                &self.bank,
                &self.settings.signals,
                self.settings.frequency,
                cycles,
            )
        });

        let mut slot = self.lock();
        slot.starting = false;
        let session = opened?;
        if slot.sealed {
            drop(slot);
            let _ = session.close();
            return Err(TraceError::Closed);
        }
        slot.session = Some(session);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Closes the open session; returns the number of changes it recorded.
    pub fn stop(&self) -> Result<u64, TraceError> {
        let session = {
            let mut slot = self.lock();
            self.active.store(false, Ordering::Release);
            slot.session.take()
        };
        let session = session.ok_or(TraceError::NotActive)?;
        let records = session.close()?;
        info!(records, "trace stopped");
        Ok(records)
    }

    /// Appends a change to the open session, if any.
    ///
    /// A failing sink closes the session; the execution thread carries on.
    pub fn record(&self, cycles: u64, change: SignalChange) {
        if !self.is_active() {
            return;
        }
        let mut slot = self.lock();
        let Some(session) = slot.session.as_mut() else {
            return;
        };
        if let Err(e) = session.record(cycles, change) {
            warn!(error = %e, "trace sink failed; closing session");
            self.active.store(false, Ordering::Release);
            slot.session = None;
        }
    }

    /// True once [`TraceGateway::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.lock().sealed
    }

    /// Closes any open session at shutdown and refuses new ones from then on.
    pub fn close(&self) {
        self.lock().sealed = true;
        match self.stop() {
            Ok(_) | Err(TraceError::NotActive) => {}
            Err(e) => warn!(error = %e, "trace close failed"),
        }
    }
}
