//! GDB remote-debug gateway.
//!
//! The gateway thread owns the TCP endpoint and never touches the machine. It
//! turns debugger packets into [`DebugRequest`]s sent over a channel; the
//! execution thread services them between steps (or while stopped) and
//! reports stops back as [`StopEvent`]s.
//!
//! Memory map seen by the debugger: flash at `0x000000`, SRAM at [`SRAM_BASE`].
//! Register file for `g`: the core's general registers followed by the
//! 32-bit little-endian program counter.

use std::collections::BTreeSet;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::{DebugProtocolError, HarnessError};
use crate::debug::rsp::{self, Command, Incoming, PacketReader};
use crate::sim::context::SharedState;

/// Debugger address of SRAM byte 0.
pub const SRAM_BASE: u32 = 0x80_0000;

/// Socket read timeout; bounds how long the gateway takes to notice shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// POSIX signal numbers used in stop replies.
pub mod signal {
    /// Interrupted by the debugger.
    pub const SIGINT: u8 = 2;
    /// Breakpoint or single step.
    pub const SIGTRAP: u8 = 5;
    /// The machine crashed.
    pub const SIGSEGV: u8 = 11;
}

/// Work the execution thread performs for the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugRequest {
    /// All registers followed by the program counter.
    ReadRegisters,
    /// One register; the index past the last general register is the PC.
    ReadRegister(usize),
    /// Writes one register: one byte for a general register, four
    /// little-endian bytes for the PC.
    WriteRegister {
        /// Register number, as for [`DebugRequest::ReadRegister`].
        index: usize,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Read from the debugger address space.
    ReadMemory {
        /// Debugger address.
        addr: u32,
        /// Byte count.
        len: usize,
    },
    /// Write into the debugger address space.
    WriteMemory {
        /// Debugger address.
        addr: u32,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Stop before executing the instruction at this address.
    InsertBreakpoint(u32),
    /// Remove a breakpoint.
    RemoveBreakpoint(u32),
    /// Resume until the next stop.
    Continue,
    /// Execute one instruction, then stop.
    Step,
    /// Stop a running machine.
    Interrupt,
    /// Shut the harness down.
    Kill,
    /// End the debug session and let the machine run freely.
    Detach,
}

/// Answer to a [`DebugRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugReply {
    /// Register or memory contents.
    Data(Vec<u8>),
    /// Request carried out.
    Ok,
    /// Request rejected (out-of-range address, machine terminated).
    Error,
    /// The machine is running; a [`StopEvent`] follows.
    Resumed,
}

/// A request plus the channel its reply goes back on.
#[derive(Debug)]
pub struct DebugCommand {
    /// What to do.
    pub request: DebugRequest,
    /// Where to answer.
    pub reply: Sender<DebugReply>,
}

/// Why the machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Stopped with a signal (see [`signal`]).
    Signal(u8),
    /// The program finished with an exit code.
    Exited(u8),
}

impl StopEvent {
    /// Stop-reply packet payload (`S05`, `W00`, ...).
    pub fn packet(self) -> String {
        match self {
            Self::Signal(sig) => format!("S{sig:02x}"),
            Self::Exited(code) => format!("W{code:02x}"),
        }
    }
}

/// Execution-thread end of a debug session.
#[derive(Debug)]
pub struct DebugLink {
    commands: Receiver<DebugCommand>,
    stops: Sender<StopEvent>,
    breakpoints: BTreeSet<u32>,
    /// Breakpoint address to step over once after a resume.
    skip_once: Option<u32>,
    /// Stop again after the next step.
    stepping: bool,
}

/// Gateway end of a debug session.
#[derive(Debug)]
pub struct DebugClient {
    commands: Sender<DebugCommand>,
    stops: Receiver<StopEvent>,
}

/// Creates a connected link/client pair.
pub fn channel() -> (DebugLink, DebugClient) {
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    (
        DebugLink {
            commands: cmd_rx,
            stops: stop_tx,
            breakpoints: BTreeSet::new(),
            skip_once: None,
            stepping: false,
        },
        DebugClient {
            commands: cmd_tx,
            stops: stop_rx,
        },
    )
}

impl DebugLink {
    /// Next pending command, if any. `Err(())` once the client is gone.
    pub(crate) fn try_next(&self) -> Result<Option<DebugCommand>, ()> {
        match self.commands.try_recv() {
            Ok(cmd) => Ok(Some(cmd)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(()),
        }
    }

    /// Reports a stop; a vanished client is ignored.
    pub(crate) fn notify(&self, event: StopEvent) {
        let _ = self.stops.send(event);
    }

    /// True if execution must stop before the instruction at `pc`.
    pub(crate) fn should_break(&mut self, pc: u32) -> bool {
        if self.skip_once.take() == Some(pc) {
            return false;
        }
        self.breakpoints.contains(&pc)
    }

    /// Arms a resume from `pc`, stepping over a breakpoint there.
    pub(crate) fn resume_from(&mut self, pc: u32, single_step: bool) {
        self.skip_once = Some(pc);
        self.stepping = single_step;
    }

    /// Clears and returns the single-step flag.
    pub(crate) fn take_stepping(&mut self) -> bool {
        std::mem::take(&mut self.stepping)
    }

    /// Inserts or removes a breakpoint.
    pub(crate) fn set_breakpoint(&mut self, addr: u32, present: bool) {
        if present {
            let _ = self.breakpoints.insert(addr);
        } else {
            let _ = self.breakpoints.remove(&addr);
        }
    }
}

impl DebugClient {
    /// Sends a request and waits for the execution thread's reply.
    pub fn request(&self, request: DebugRequest) -> Result<DebugReply, DebugProtocolError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(DebugCommand {
                request,
                reply: reply_tx,
            })
            .map_err(|_| DebugProtocolError::Detached)?;
        reply_rx.recv().map_err(|_| DebugProtocolError::Detached)
    }

    /// Waits up to `timeout` for the next stop.
    pub fn next_stop(&self, timeout: Duration) -> Result<Option<StopEvent>, DebugProtocolError> {
        match self.stops.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DebugProtocolError::Detached),
        }
    }

    /// Drops stop events nobody waited for.
    fn drain_stops(&self) {
        while self.stops.try_recv().is_ok() {}
    }

    /// Most recent stop nobody waited for, draining older ones.
    fn latest_stop(&self) -> Option<StopEvent> {
        let mut latest = None;
        while let Ok(event) = self.stops.try_recv() {
            latest = Some(event);
        }
        latest
    }
}

/// The TCP endpoint plus its serving thread.
#[derive(Debug)]
pub struct DebugGateway {
    addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl DebugGateway {
    /// Binds `127.0.0.1:port` and starts serving `client` on a gateway thread.
    ///
    /// Port 0 picks a free port; see [`DebugGateway::local_addr`].
    pub fn spawn(
        port: u16,
        client: DebugClient,
        shared: Arc<SharedState>,
    ) -> Result<Self, HarnessError> {
        let endpoint = |source| HarnessError::DebugEndpoint { port, source };
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).map_err(endpoint)?;
        listener.set_nonblocking(true).map_err(endpoint)?;
        let addr = listener.local_addr().map_err(endpoint)?;
        shared.set_debug_endpoint(addr);

        let handle = thread::Builder::new()
            .name("gdb-gateway".to_string())
            .spawn(move || serve(&listener, &client, &shared))
            .map_err(HarnessError::Spawn)?;

        info!(%addr, "waiting for gdb; use 'target remote :{}'", addr.port());
        Ok(Self {
            addr,
            handle: Some(handle),
        })
    }

    /// Address the endpoint listens on.
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the gateway thread; it exits once the harness has finished.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("gdb gateway thread panicked");
            }
        }
    }
}

fn serve(listener: &TcpListener, client: &DebugClient, shared: &SharedState) {
    while !shared.is_finished() {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "debugger connected");
                let end = Session::new(stream, client, shared).and_then(|mut s| s.run());
                match end {
                    Ok(SessionEnd::Killed) => {
                        info!("debugger killed the target");
                        return;
                    }
                    Ok(end) => info!(?end, "debugger disconnected"),
                    Err(e) => warn!(error = %e, "debugger connection failed"),
                }
                if !matches!(client.request(DebugRequest::Detach), Ok(_)) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!(error = %e, "debug endpoint failed");
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Detached,
    Killed,
}

/// One connected debugger.
struct Session<'a> {
    stream: TcpStream,
    reader: PacketReader,
    pending: Vec<Incoming>,
    client: &'a DebugClient,
    shared: &'a SharedState,
    last_stop: StopEvent,
    last_reply: Vec<u8>,
}

impl<'a> Session<'a> {
    fn new(
        stream: TcpStream,
        client: &'a DebugClient,
        shared: &'a SharedState,
    ) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_nodelay(true)?;
        let last_stop = client
            .latest_stop()
            .unwrap_or(StopEvent::Signal(signal::SIGTRAP));
        Ok(Self {
            stream,
            reader: PacketReader::new(),
            pending: Vec::new(),
            client,
            shared,
            last_stop,
            last_reply: Vec::new(),
        })
    }

    fn run(&mut self) -> io::Result<SessionEnd> {
        loop {
            let Some(unit) = self.next_unit()? else {
                return Ok(SessionEnd::Closed);
            };
            match unit {
                Incoming::Ack => {}
                Incoming::Nack => {
                    let last = self.last_reply.clone();
                    self.stream.write_all(&last)?;
                }
                Incoming::Interrupt => {
                    let _ = self.client.request(DebugRequest::Interrupt);
                }
                Incoming::Malformed(e) => {
                    debug!(error = %e, "malformed gdb packet");
                    self.stream.write_all(b"-")?;
                    self.send("E01")?;
                }
                Incoming::Packet(payload) => {
                    self.stream.write_all(b"+")?;
                    if let Some(end) = self.handle(&payload)? {
                        return Ok(end);
                    }
                }
            }
        }
    }

    /// Reads until one unit is decoded; `None` on disconnect or shutdown.
    fn next_unit(&mut self) -> io::Result<Option<Incoming>> {
        loop {
            if !self.pending.is_empty() {
                return Ok(Some(self.pending.remove(0)));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Reads what the socket has; `false` on disconnect or shutdown.
    fn fill(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 512];
        match self.stream.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(n) => {
                for &b in &buf[..n] {
                    if let Some(unit) = self.reader.push(b) {
                        self.pending.push(unit);
                    }
                }
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(!self.shared.is_finished())
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, payload: &str) -> io::Result<()> {
        self.last_reply = rsp::encode(payload);
        self.stream.write_all(&self.last_reply)?;
        self.stream.flush()
    }

    fn handle(&mut self, payload: &str) -> io::Result<Option<SessionEnd>> {
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, payload, "rejected gdb packet");
                self.send("E01")?;
                return Ok(None);
            }
        };

        let reply = match command {
            Command::HaltReason => self.last_stop.packet(),
            Command::ReadRegisters => self.data_reply(DebugRequest::ReadRegisters),
            Command::ReadRegister(n) => self.data_reply(DebugRequest::ReadRegister(n)),
            Command::WriteRegister { index, value } => {
                self.ok_reply(DebugRequest::WriteRegister { index, value })
            }
            Command::ReadMemory { addr, len } => {
                self.data_reply(DebugRequest::ReadMemory { addr, len })
            }
            Command::WriteMemory { addr, data } => {
                self.ok_reply(DebugRequest::WriteMemory { addr, data })
            }
            Command::InsertBreakpoint(addr) => self.ok_reply(DebugRequest::InsertBreakpoint(addr)),
            Command::RemoveBreakpoint(addr) => self.ok_reply(DebugRequest::RemoveBreakpoint(addr)),
            Command::Continue => self.resume(DebugRequest::Continue)?,
            Command::Step => self.resume(DebugRequest::Step)?,
            Command::Kill => {
                let _ = self.client.request(DebugRequest::Kill);
                return Ok(Some(SessionEnd::Killed));
            }
            Command::Detach => {
                self.send("OK")?;
                return Ok(Some(SessionEnd::Detached));
            }
            Command::QuerySupported => format!("PacketSize={:x}", rsp::PACKET_SIZE),
            Command::QueryAttached => "1".to_string(),
            Command::Unsupported => String::new(),
        };
        self.send(&reply)?;
        Ok(None)
    }

    fn data_reply(&self, request: DebugRequest) -> String {
        match self.client.request(request) {
            Ok(DebugReply::Data(bytes)) => rsp::to_hex(&bytes),
            _ => "E01".to_string(),
        }
    }

    fn ok_reply(&self, request: DebugRequest) -> String {
        match self.client.request(request) {
            Ok(DebugReply::Ok) => "OK".to_string(),
            _ => "E01".to_string(),
        }
    }

    /// Resumes the machine and waits for its next stop, forwarding Ctrl-C.
    fn resume(&mut self, request: DebugRequest) -> io::Result<String> {
        self.client.drain_stops();
        match self.client.request(request) {
            Ok(DebugReply::Resumed) => {}
            Ok(_) | Err(_) => return Ok("E01".to_string()),
        }
        loop {
            match self.client.next_stop(POLL_INTERVAL) {
                Ok(Some(event)) => {
                    self.last_stop = event;
                    return Ok(event.packet());
                }
                Ok(None) => {}
                Err(_) => return Ok(StopEvent::Exited(0).packet()),
            }
            if !self.fill()? {
                let _ = self.client.request(DebugRequest::Interrupt);
                return Ok(StopEvent::Signal(signal::SIGINT).packet());
            }
            let interrupted = self
                .pending
                .iter()
                .any(|u| matches!(u, Incoming::Interrupt));
            self.pending.retain(|u| !matches!(u, Incoming::Interrupt));
            if interrupted {
                let _ = self.client.request(DebugRequest::Interrupt);
            }
        }
    }
}
