//! Thermistor on an ADC channel.
//!
//! Bound to `ADMUX`. Whenever the firmware selects this thermistor's channel,
//! the model drives `ADC` with the conversion result for its current
//! temperature, read off an oversampled lookup table.

use tracing::trace;

use crate::common::{SignalChange, SignalDriver};
use crate::devices::Peripheral;

/// Multiplexer channel bits of `ADMUX`.
const MUX_MASK: u32 = 0x1F;

/// Largest 10-bit conversion result.
const ADC_MAX: u32 = 0x3FF;

/// Oversampling factor the built-in table was generated with.
pub const TABLE_OVERSAMPLE: u32 = 16;

/// `(raw ADC × 16, °C)` pairs for a 100k semitec thermistor, raw ascending.
pub static SEMITEC_104GT: &[(u32, f32)] = &[
    (16, 713.0),
    (272, 300.0),
    (320, 290.0),
    (368, 280.0),
    (432, 270.0),
    (496, 260.0),
    (592, 250.0),
    (688, 240.0),
    (816, 230.0),
    (976, 220.0),
    (1168, 210.0),
    (1392, 200.0),
    (1696, 190.0),
    (2048, 180.0),
    (2480, 170.0),
    (3024, 160.0),
    (3680, 150.0),
    (4448, 140.0),
    (5376, 130.0),
    (6432, 120.0),
    (7616, 110.0),
    (8864, 100.0),
    (10160, 90.0),
    (11408, 80.0),
    (12544, 70.0),
    (13536, 60.0),
    (14352, 50.0),
    (14992, 40.0),
    (15456, 30.0),
    (15776, 20.0),
    (16000, 10.0),
    (16160, 0.0),
];

/// Temperature sensor model.
#[derive(Debug)]
pub struct Thermistor {
    name: String,
    channel: u8,
    table: &'static [(u32, f32)],
    oversample: u32,
    temperature: f32,
    conversions: u64,
}

impl Thermistor {
    /// Creates a thermistor on `channel` using the built-in table.
    pub fn new(channel: u8, temperature: f32) -> Self {
        Self::with_table(channel, SEMITEC_104GT, TABLE_OVERSAMPLE, temperature)
    }

    /// Creates a thermistor with a custom `(raw × oversample, °C)` table.
    pub fn with_table(
        channel: u8,
        table: &'static [(u32, f32)],
        oversample: u32,
        temperature: f32,
    ) -> Self {
        Self {
            name: format!("thermistor{channel}"),
            channel,
            table,
            oversample: oversample.max(1),
            temperature,
            conversions: 0,
        }
    }

    /// Sets the simulated temperature in °C.
    pub fn set_temperature(&mut self, celsius: f32) {
        self.temperature = celsius;
    }

    /// Current simulated temperature in °C.
    pub const fn temperature(&self) -> f32 {
        self.temperature
    }

    /// ADC channel this thermistor answers on.
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Conversions answered so far.
    pub const fn conversions(&self) -> u64 {
        self.conversions
    }

    /// 10-bit conversion result for the current temperature.
    ///
    /// Temperatures outside the table clamp to its first or last entry.
    pub fn adc_value(&self) -> u32 {
        let raw = self.oversampled_value();
        (raw / self.oversample).min(ADC_MAX)
    }

    fn oversampled_value(&self) -> u32 {
        let t = self.temperature;
        let (Some(&(first_raw, first_t)), Some(&(last_raw, last_t))) =
            (self.table.first(), self.table.last())
        else {
            return 0;
        };
        if t >= first_t {
            return first_raw;
        }
        if t <= last_t {
            return last_raw;
        }
        self.table
            .windows(2)
            .find_map(|pair| {
                let (r0, t0) = pair[0];
                let (r1, t1) = pair[1];
                (t <= t0 && t >= t1).then(|| {
                    let span = t0 - t1;
                    if span <= f32::EPSILON {
                        return r0;
                    }
                    let frac = (t0 - t) / span;
                    r0 + ((r1 - r0) as f32 * frac) as u32
                })
            })
            .unwrap_or(last_raw)
    }
}

impl Peripheral for Thermistor {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_signal_changed(&mut self, change: SignalChange, io: &mut dyn SignalDriver) {
        if change.new & MUX_MASK != u32::from(self.channel) {
            return;
        }
        let Some(adc) = io.lookup("ADC") else {
            return;
        };
        let value = self.adc_value();
        self.conversions += 1;
        trace!(channel = self.channel, value, "adc conversion");
        io.drive(adc, value);
    }
}
