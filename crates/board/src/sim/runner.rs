//! Execution thread.
//!
//! Runs the step loop until the machine reaches a terminal state or quit is
//! requested. The loop never sleeps while Running; while Stopped it parks on a
//! [`RunGate`] with a bounded timeout so quit and debugger requests are picked
//! up promptly. A teardown guard runs the shutdown sequence (flash save,
//! peripheral teardown, trace close) exactly once on every exit path,
//! unwinding included.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::common::{HarnessError, StorageError};
use crate::machine::RunState;
use crate::sim::context::{SharedState, ShutdownReport, SimContext};

/// Longest the stopped execution thread sleeps between checks.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Wake-up point for a stopped execution thread.
#[derive(Debug, Default)]
pub(crate) struct RunGate {
    lock: Mutex<()>,
    cond: Condvar,
}

impl RunGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sleeps until notified or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .cond
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub(crate) fn notify(&self) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cond.notify_all();
    }
}

/// What the execution thread did, returned by [`ExecutionHandle::join`].
#[derive(Debug)]
pub struct ExitReport {
    /// Run-state when the loop ended (`Running`/`Stopped` if quit ended it).
    pub state: RunState,
    /// Steps executed.
    pub steps: u64,
    /// Machine cycles executed.
    pub cycles: u64,
    /// True if the loop ended because quit was requested.
    pub quit: bool,
    /// Hooks whose deinit ran (the flash save among them).
    pub hooks_run: usize,
    /// Deinit failures; a failed flash save shows up here.
    pub deinit_failures: Vec<StorageError>,
    /// Peripheral models torn down.
    pub torn_down: usize,
}

impl ExitReport {
    fn new(state: RunState, steps: u64, cycles: u64, quit: bool, shutdown: ShutdownReport) -> Self {
        Self {
            state,
            steps,
            cycles,
            quit,
            hooks_run: shutdown.hooks_run,
            deinit_failures: shutdown.deinit_failures,
            torn_down: shutdown.torn_down,
        }
    }

    /// True if every deinit hook succeeded.
    pub fn saved_cleanly(&self) -> bool {
        self.deinit_failures.is_empty()
    }
}

/// Runs the shutdown sequence when dropped, whatever ended the loop.
///
/// A teardown run here (the loop unwound) leaves its report in
/// [`SharedState`] for [`ExecutionHandle::join`].
struct TeardownGuard {
    ctx: SimContext,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.ctx.is_shut_down() {
            return;
        }
        let report = self.ctx.shutdown();
        self.ctx.shared().keep_shutdown_report(report);
    }
}

/// Join handle of the execution thread.
#[derive(Debug)]
pub struct ExecutionHandle {
    handle: JoinHandle<ExitReport>,
    shared: Arc<SharedState>,
}

impl ExecutionHandle {
    /// Cross-thread state of the running machine.
    pub const fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// True once the thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the thread, teardown included.
    ///
    /// A panicked thread has still run its teardown; it reports `Crashed`
    /// with that teardown's outcome.
    pub fn join(self) -> ExitReport {
        match self.handle.join() {
            Ok(report) => report,
            Err(_) => {
                error!("execution thread panicked");
                ExitReport::new(
                    RunState::Crashed,
                    self.shared.steps(),
                    self.shared.cycles(),
                    self.shared.quit_requested(),
                    self.shared.take_shutdown_report().unwrap_or_default(),
                )
            }
        }
    }
}

/// Moves `ctx` onto a new execution thread and starts stepping.
pub fn spawn(ctx: SimContext) -> Result<ExecutionHandle, HarnessError> {
    let shared = ctx.shared();
    let handle = thread::Builder::new()
        .name("execution".to_string())
        .spawn(move || run(ctx))
        .map_err(HarnessError::Spawn)?;
    Ok(ExecutionHandle { handle, shared })
}

/// The step loop; owns the context until teardown.
pub fn run(ctx: SimContext) -> ExitReport {
    let shared = ctx.shared();
    let mut guard = TeardownGuard { ctx };
    let ctx = &mut guard.ctx;
    let mut steps: u64 = 0;

    info!(state = %ctx.machine().run_state(), pc = ctx.machine().pc(), "execution thread started");

    let state = loop {
        if shared.quit_requested() {
            break ctx.machine().run_state();
        }
        ctx.service_debug();

        match ctx.machine().run_state() {
            RunState::Running => {}
            RunState::Stopped => {
                shared.gate().wait(PARK_TIMEOUT);
                continue;
            }
            terminal => break terminal,
        }

        if ctx.check_breakpoint() {
            continue;
        }

        let reported = ctx.step();
        steps += 1;
        let state = ctx.apply_step_result(reported);
        if state.is_terminal() {
            break state;
        }
    };

    let quit = shared.quit_requested();
    debug!(%state, steps, quit, "execution loop ended");
    let cycles = ctx.machine().cycles();
    let shutdown = ctx.shutdown();
    info!(
        %state,
        steps,
        cycles,
        saved = shutdown.deinit_failures.is_empty(),
        "execution thread finished"
    );
    ExitReport::new(state, steps, cycles, quit, shutdown)
}
