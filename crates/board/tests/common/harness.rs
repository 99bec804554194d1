use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mcuboard_core::config::TraceConfig;
use mcuboard_core::machine::{self, Rails};
use mcuboard_core::sim::{ExecutionHandle, SimContext};

use crate::common::asm::Asm;

/// Model every suite runs on unless it says otherwise.
pub const MODEL: &str = "atmega644";

/// Flash size of [`MODEL`].
pub const FLASH_SIZE: usize = 64 * 1024;

/// Clock used by the test contexts (1 cycle = 1 µs).
pub const FREQUENCY: u32 = 1_000_000;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Context running `program` with trace sessions written to `trace_path`.
pub fn context_with_trace(program: &Asm, trace_path: &Path, signals: &[&str]) -> SimContext {
    init_tracing();
    let mut machine = machine::create(MODEL).unwrap();
    machine.configure(FREQUENCY, Rails::default());
    let trace = TraceConfig {
        path: trace_path.to_path_buf(),
        signals: signals.iter().map(ToString::to_string).collect(),
    };
    let mut ctx = SimContext::new(machine, &trace);
    ctx.load_program(&program.image()).unwrap();
    ctx
}

/// Context running `program`; tracing goes nowhere useful.
pub fn context(program: &Asm) -> SimContext {
    context_with_trace(program, &PathBuf::from("unused-trace.vcd"), &[])
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Waits for the execution thread to return on its own.
pub fn wait_finished(handle: &ExecutionHandle) -> bool {
    wait_until(Duration::from_secs(5), || handle.is_finished())
}

/// Cloneable in-memory writer for UART output and trace sinks.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
