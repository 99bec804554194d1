//! Board harness CLI.
//!
//! This binary runs one firmware image on a simulated board. It performs:
//! 1. **Startup:** Load configuration and firmware, create the machine, restore flash
//!    and attach the configured peripherals.
//! 2. **Run:** Step the machine on its execution thread while this thread reads keys
//!    and refreshes the dashboard.
//! 3. **Exit:** Join the execution thread (flash save included) and exit 0; startup
//!    failures exit 1.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mcuboard_core::common::HarnessError;
use mcuboard_core::config::Config;
use mcuboard_core::control::{self, ControlSurface, NullRenderer, Renderer, TextDashboard};
use mcuboard_core::debug::{DebugGateway, gdb};
use mcuboard_core::machine::{self, Rails};
use mcuboard_core::sim::{self, ExitReport, SimContext};
use mcuboard_core::storage::FlashBacking;

#[derive(Parser, Debug)]
#[command(
    name = "board",
    author,
    version,
    about = "Threaded board harness for simulated 8-bit microcontrollers",
    long_about = "Run firmware on a simulated board with persistent flash, VCD tracing and a GDB endpoint.\n\nKeys (followed by Enter): q quit, space press button, r start trace, s stop trace.\nOther input goes to UART0.\n\nExamples:\n  board firmware.hex\n  board -d firmware.elf --port 1234\n  board --config board.json --headless --no-crash-debug firmware.bin"
)]
struct Cli {
    /// Firmware image (ELF, Intel HEX or raw binary).
    firmware: PathBuf,

    /// Start stopped and wait for a GDB connection.
    #[arg(short, long)]
    debug: bool,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persistent flash backing file.
    #[arg(long)]
    flash: Option<PathBuf>,

    /// Target model (overrides config and firmware).
    #[arg(long)]
    model: Option<String>,

    /// Core clock in Hz (overrides config and firmware).
    #[arg(long)]
    frequency: Option<u32>,

    /// GDB endpoint port.
    #[arg(long)]
    port: Option<u16>,

    /// End the run on a crash instead of waiting for GDB.
    #[arg(long)]
    no_crash_debug: bool,

    /// No dashboard and no key input; run until the firmware finishes.
    #[arg(long)]
    headless: bool,
}

/// Running pieces the control loop drives.
struct Session {
    handle: sim::ExecutionHandle,
    gateway: Option<DebugGateway>,
    uart_input: Option<Sender<u8>>,
    button: Option<String>,
    refresh_hz: u32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let session = match start(&cli) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "startup failed");
            process::exit(1);
        }
    };
    let report = run(session, cli.headless);
    info!(
        state = %report.state,
        steps = report.steps,
        cycles = report.cycles,
        saved = report.saved_cleanly(),
        "exiting"
    );
}

/// Builds the context, attaches devices and spawns the execution thread.
fn start(cli: &Cli) -> Result<Session, HarnessError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };

    let image = sim::load_firmware(&cli.firmware)?;
    if let Some(model) = &image.model {
        config.general.model.clone_from(model);
    }
    if let Some(frequency) = image.frequency {
        config.general.frequency = frequency;
    }
    if let Some(model) = &cli.model {
        config.general.model.clone_from(model);
    }
    if let Some(frequency) = cli.frequency {
        config.general.frequency = frequency;
    }
    if let Some(flash) = &cli.flash {
        config.storage.flash_path.clone_from(flash);
    }
    if let Some(port) = cli.port {
        config.debug.port = port;
    }
    config.debug.attach_on_start |= cli.debug;
    config.debug.attach_on_crash &= !cli.no_crash_debug;

    let mut machine = machine::create(&config.general.model)?;
    machine.configure(
        config.general.frequency,
        Rails {
            vcc_mv: config.general.vcc_mv,
            avcc_mv: config.general.avcc_mv,
            aref_mv: config.general.aref_mv,
        },
    );
    info!(
        model = %config.general.model,
        frequency = config.general.frequency,
        flash = %config.storage.flash_path.display(),
        "board configured"
    );

    let mut ctx = SimContext::new(machine, &config.trace);
    ctx.install_hook(Box::new(FlashBacking::new(config.storage.flash_path.clone())))?;
    ctx.load_program(&image)?;

    for thermistor in &config.devices.thermistors {
        if ctx.attach_thermistor(thermistor).is_none() {
            warn!(channel = thermistor.adc_channel, "thermistor not attached");
        }
    }
    let button = config
        .devices
        .button
        .as_ref()
        .and_then(|b| ctx.attach_button(b).map(|_| b.name.clone()));
    let uart_input = if config.devices.uart {
        ctx.attach_uart(Box::new(io::stdout()))
    } else {
        None
    };

    let gateway = if config.debug.attach_on_start {
        let (link, client) = gdb::channel();
        ctx.attach_debugger(link);
        Some(DebugGateway::spawn(config.debug.port, client, ctx.shared())?)
    } else {
        if config.debug.attach_on_crash {
            ctx.set_crash_debug_port(Some(config.debug.port));
        }
        None
    };

    let handle = sim::spawn(ctx)?;
    Ok(Session {
        handle,
        gateway,
        uart_input,
        button,
        refresh_hz: config.display.refresh_hz.max(1),
    })
}

/// Drives the control loop until the execution thread finishes.
fn run(session: Session, headless: bool) -> ExitReport {
    let Session {
        handle,
        gateway,
        uart_input,
        button,
        refresh_hz,
    } = session;

    let mut surface = ControlSurface::new(handle.shared().clone());
    if let Some(name) = button {
        surface = surface.with_button_input(name);
    }
    let keys = if headless { None } else { spawn_key_reader() };
    let mut renderer: Box<dyn Renderer> = if headless {
        Box::new(NullRenderer)
    } else {
        Box::new(TextDashboard::new(io::stderr()))
    };
    let period = Duration::from_secs(1) / refresh_hz;

    while !handle.is_finished() {
        if let Some(keys) = &keys {
            drain_keys(keys, &surface, uart_input.as_ref());
        }
        if let Err(e) = renderer.render(&surface.tick()) {
            warn!(error = %e, "dashboard write failed");
        }
        thread::sleep(period);
    }

    let report = handle.join();
    if let Some(gateway) = gateway {
        gateway.join();
    }
    report
}

/// Applies every key read since the last tick; unmapped keys feed UART0.RX.
fn drain_keys(keys: &Receiver<char>, surface: &ControlSurface, uart: Option<&Sender<u8>>) {
    while let Ok(key) = keys.try_recv() {
        if control::is_command_key(key) {
            let _ = surface.handle_key(key);
        } else if let (Some(uart), Ok(byte)) = (uart, u8::try_from(key)) {
            let _ = uart.send(byte);
        }
    }
}

/// Reads stdin on a helper thread; the channel closes at end of input.
fn spawn_key_reader() -> Option<Receiver<char>> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name("keys".to_string())
        .spawn(move || {
            for byte in io::stdin().lock().bytes() {
                let Ok(byte) = byte else { break };
                if byte == b'\n' || byte == b'\r' {
                    continue;
                }
                if tx.send(char::from(byte)).is_err() {
                    break;
                }
            }
        });
    match spawned {
        Ok(_) => Some(rx),
        Err(e) => {
            warn!(error = %e, "cannot read keys");
            None
        }
    }
}
