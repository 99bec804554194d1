//! Configuration system for the board harness.
//!
//! This module defines all configuration structures used to parameterize a run.
//! It provides:
//! 1. **Defaults:** Baseline board constants (model, clock, rails, ports, file names).
//! 2. **Structures:** Hierarchical config for general, storage, debug, trace, display and devices.
//!
//! Configuration is supplied as JSON (`Config::from_json_file`) or built with
//! `Config::default()`; CLI flags override individual fields afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::common::HarnessError;

/// Default configuration constants for the harness.
mod defaults {
    /// Target model simulated when neither firmware nor config names one.
    pub const MODEL: &str = "atmega644";

    /// Core clock frequency in Hz (20 MHz).
    pub const FREQUENCY: u32 = 20_000_000;

    /// Supply and reference rails in millivolts; the ADC needs all three.
    pub const RAIL_MV: u32 = 5 * 1000;

    /// Backing file for the persistent flash image.
    pub const FLASH_PATH: &str = "reprap_flash.bin";

    /// TCP port of the GDB remote-serial-protocol endpoint.
    pub const DEBUG_PORT: u16 = 1234;

    /// Open the GDB endpoint when the machine crashes, even without `-d`.
    pub const ATTACH_ON_CRASH: bool = true;

    /// VCD output of a trace session.
    pub const TRACE_PATH: &str = "trace.vcd";

    /// Refresh cadence of the control surface in Hz.
    pub const REFRESH_HZ: u32 = 64;

    /// Signal the push button drives.
    pub const BUTTON_SIGNAL: &str = "PINC";

    /// Bit of the button signal that reads low while pressed.
    pub const BUTTON_BIT: u8 = 0;

    /// ADC oversampling factor of the thermistor tables.
    pub const OVERSAMPLE: u32 = 16;
}

/// Root configuration.
///
/// ```
/// use mcuboard_core::config::Config;
///
/// let json = r#"{
///     "general": { "model": "atmega328p", "frequency": 16000000 },
///     "debug": { "attach_on_start": true }
/// }"#;
///
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.general.model, "atmega328p");
/// assert!(config.debug.attach_on_start);
/// assert_eq!(config.debug.port, 1234);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Target model, clock and supply rails
    #[serde(default)]
    pub general: GeneralConfig,
    /// Persistent flash backing file
    #[serde(default)]
    pub storage: StorageConfig,
    /// Remote-debug endpoint
    #[serde(default)]
    pub debug: DebugConfig,
    /// Trace session output
    #[serde(default)]
    pub trace: TraceConfig,
    /// Control surface refresh
    #[serde(default)]
    pub display: DisplayConfig,
    /// Peripheral models attached at startup
    #[serde(default)]
    pub devices: DeviceConfig,
}

impl Config {
    /// Reads a JSON configuration file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, HarnessError> {
        let text = fs::read_to_string(path).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Target model, clock and supply rails.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Model name passed to the machine core; a firmware-declared model wins
    #[serde(default = "GeneralConfig::default_model")]
    pub model: String,

    /// Core clock in Hz; a firmware-declared frequency wins
    #[serde(default = "GeneralConfig::default_frequency")]
    pub frequency: u32,

    /// Digital supply rail in mV
    #[serde(default = "GeneralConfig::default_rail")]
    pub vcc_mv: u32,

    /// Analog supply rail in mV
    #[serde(default = "GeneralConfig::default_rail")]
    pub avcc_mv: u32,

    /// ADC reference in mV
    #[serde(default = "GeneralConfig::default_rail")]
    pub aref_mv: u32,
}

impl GeneralConfig {
    fn default_model() -> String {
        defaults::MODEL.to_string()
    }

    fn default_frequency() -> u32 {
        defaults::FREQUENCY
    }

    fn default_rail() -> u32 {
        defaults::RAIL_MV
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: defaults::MODEL.to_string(),
            frequency: defaults::FREQUENCY,
            vcc_mv: defaults::RAIL_MV,
            avcc_mv: defaults::RAIL_MV,
            aref_mv: defaults::RAIL_MV,
        }
    }
}

/// Persistent flash backing file.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Flat raw image of the simulated flash, exactly `flash_size` bytes
    #[serde(default = "StorageConfig::default_flash_path")]
    pub flash_path: PathBuf,
}

impl StorageConfig {
    fn default_flash_path() -> PathBuf {
        PathBuf::from(defaults::FLASH_PATH)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flash_path: Self::default_flash_path(),
        }
    }
}

/// Remote-debug endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DebugConfig {
    /// TCP port on 127.0.0.1
    #[serde(default = "DebugConfig::default_port")]
    pub port: u16,

    /// Open the endpoint before the first step and start Stopped
    #[serde(default)]
    pub attach_on_start: bool,

    /// Open the endpoint when the machine crashes instead of shutting down
    #[serde(default = "DebugConfig::default_attach_on_crash")]
    pub attach_on_crash: bool,
}

impl DebugConfig {
    fn default_port() -> u16 {
        defaults::DEBUG_PORT
    }

    fn default_attach_on_crash() -> bool {
        defaults::ATTACH_ON_CRASH
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            port: defaults::DEBUG_PORT,
            attach_on_start: false,
            attach_on_crash: defaults::ATTACH_ON_CRASH,
        }
    }
}

/// Trace session output.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// VCD file written by each session (truncated on start)
    #[serde(default = "TraceConfig::default_path")]
    pub path: PathBuf,

    /// Signal names to monitor; empty monitors every signal
    #[serde(default)]
    pub signals: Vec<String>,
}

impl TraceConfig {
    fn default_path() -> PathBuf {
        PathBuf::from(defaults::TRACE_PATH)
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            signals: Vec::new(),
        }
    }
}

/// Control surface refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    /// Wall-clock refresh ticks per second
    #[serde(default = "DisplayConfig::default_refresh_hz")]
    pub refresh_hz: u32,
}

impl DisplayConfig {
    fn default_refresh_hz() -> u32 {
        defaults::REFRESH_HZ
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: defaults::REFRESH_HZ,
        }
    }
}

/// Peripheral models attached at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Thermistors on ADC channels
    #[serde(default = "DeviceConfig::default_thermistors")]
    pub thermistors: Vec<ThermistorConfig>,

    /// Push button; `None` leaves no button attached
    #[serde(default = "DeviceConfig::default_button")]
    pub button: Option<ButtonConfig>,

    /// Bridge UART0 to the host console
    #[serde(default = "DeviceConfig::default_uart")]
    pub uart: bool,
}

impl DeviceConfig {
    /// Hotend, bed and spare sensors of the reference board.
    fn default_thermistors() -> Vec<ThermistorConfig> {
        vec![
            ThermistorConfig::new(0, 25.0),
            ThermistorConfig::new(2, 30.0),
            ThermistorConfig::new(1, 10.0),
        ]
    }

    fn default_button() -> Option<ButtonConfig> {
        Some(ButtonConfig::default())
    }

    fn default_uart() -> bool {
        true
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            thermistors: Self::default_thermistors(),
            button: Self::default_button(),
            uart: true,
        }
    }
}

/// One thermistor on an ADC channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ThermistorConfig {
    /// ADC multiplexer channel
    pub adc_channel: u8,
    /// Initial temperature in °C
    pub temperature: f32,
    /// ADC oversampling factor of the lookup table
    #[serde(default = "ThermistorConfig::default_oversample")]
    pub oversample: u32,
}

impl ThermistorConfig {
    /// Creates a thermistor entry with the default oversampling.
    pub fn new(adc_channel: u8, temperature: f32) -> Self {
        Self {
            adc_channel,
            temperature,
            oversample: defaults::OVERSAMPLE,
        }
    }

    fn default_oversample() -> u32 {
        defaults::OVERSAMPLE
    }
}

/// Push button wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct ButtonConfig {
    /// Input name used by `inject_input`
    #[serde(default = "ButtonConfig::default_name")]
    pub name: String,
    /// Signal carrying the button's pin
    #[serde(default = "ButtonConfig::default_signal")]
    pub signal: String,
    /// Pin bit within the signal (active low)
    #[serde(default = "ButtonConfig::default_bit")]
    pub bit: u8,
}

impl ButtonConfig {
    fn default_name() -> String {
        "button".to_string()
    }

    fn default_signal() -> String {
        defaults::BUTTON_SIGNAL.to_string()
    }

    fn default_bit() -> u8 {
        defaults::BUTTON_BIT
    }
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            signal: Self::default_signal(),
            bit: defaults::BUTTON_BIT,
        }
    }
}
