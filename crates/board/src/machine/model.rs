//! Known target models.
//!
//! Each model fixes the flash and SRAM sizes and the ordered signal table;
//! a signal's position in the table is its `SignalId`.

/// Static description of a target model.
#[derive(Debug, PartialEq, Eq)]
pub struct ModelSpec {
    /// Name accepted by `machine::create`.
    pub name: &'static str,
    /// Size of the non-volatile program memory in bytes.
    pub flash_size: usize,
    /// Size of the data memory in bytes.
    pub sram_size: usize,
    /// Signal line names, indexed by `SignalId`.
    pub signals: &'static [&'static str],
}

/// Signal table of the 40/44-pin parts with four ports.
const FOUR_PORT_SIGNALS: &[&str] = &[
    "PORTA", "PORTB", "PORTC", "PORTD", "PINA", "PINB", "PINC", "PIND", "ADMUX", "ADC",
    "UART0.TX", "UART0.RX",
];

/// Signal table of the 28/32-pin parts without port A.
const THREE_PORT_SIGNALS: &[&str] = &[
    "PORTB", "PORTC", "PORTD", "PINB", "PINC", "PIND", "ADMUX", "ADC", "UART0.TX", "UART0.RX",
];

/// Every model the built-in core can simulate.
pub static MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "atmega644",
        flash_size: 64 * 1024,
        sram_size: 4 * 1024,
        signals: FOUR_PORT_SIGNALS,
    },
    ModelSpec {
        name: "atmega1284p",
        flash_size: 128 * 1024,
        sram_size: 16 * 1024,
        signals: FOUR_PORT_SIGNALS,
    },
    ModelSpec {
        name: "atmega328p",
        flash_size: 32 * 1024,
        sram_size: 2 * 1024,
        signals: THREE_PORT_SIGNALS,
    },
];

/// Looks a model up by name, ignoring ASCII case.
pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}
