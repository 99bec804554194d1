//! # Control Surface Tests
//!
//! Commands issued from other threads while the machine runs, the key map,
//! and the refresh frame.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mcuboard_core::config::ButtonConfig;
use mcuboard_core::control::{self, ControlSurface, KeyAction, NullRenderer, Renderer, TextDashboard};
use mcuboard_core::machine::RunState;
use mcuboard_core::sim;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::common::asm::{Asm, sig, spin};
use crate::common::harness::{SharedBuffer, context, context_with_trace, wait_until};

fn running_with_button() -> (sim::ExecutionHandle, ControlSurface, mcuboard_core::devices::InputHandle) {
    let ctx = context(&spin());
    let input = ctx.attach_button(&ButtonConfig::default()).unwrap();
    let surface = ControlSurface::new(ctx.shared());
    (sim::spawn(ctx).unwrap(), surface, input)
}

#[test]
fn test_injected_events_are_all_observed() {
    let (handle, surface, input) = running_with_button();

    for _ in 0..25 {
        assert!(surface.inject_input("button").is_some());
    }

    assert!(wait_until(Duration::from_secs(5), || input.observed() == 25));
    surface.quit();
    handle.join();
    assert_eq!(input.pending(), 0);
}

#[test]
fn test_concurrent_injection_loses_nothing() {
    let (handle, surface, input) = running_with_button();
    let surface = Arc::new(surface);

    let injectors: Vec<_> = (0..4)
        .map(|_| {
            let surface = Arc::clone(&surface);
            thread::spawn(move || {
                for _ in 0..250 {
                    surface.inject_input("button").unwrap();
                }
            })
        })
        .collect();
    for injector in injectors {
        injector.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || input.observed() == 1000));
    surface.quit();
    let report = handle.join();
    assert!(report.quit);
}

#[test]
fn test_unknown_input_is_rejected() {
    let ctx = context(&spin());
    let surface = ControlSurface::new(ctx.shared());

    assert_eq!(surface.inject_input("nope"), None);
}

#[test]
fn test_quit_is_idempotent_and_non_blocking() {
    let ctx = context(&spin());
    let surface = ControlSurface::new(ctx.shared());
    let handle = sim::spawn(ctx).unwrap();

    surface.quit();
    surface.quit();
    let report = handle.join();

    assert!(report.quit);
    assert!(surface.is_finished());
    surface.quit();
}

#[test]
fn test_key_map() {
    let dir = tempdir().unwrap();
    let ctx = context_with_trace(&spin(), &dir.path().join("keys.vcd"), &[]);
    ctx.attach_button(&ButtonConfig::default()).unwrap();
    let surface = ControlSurface::new(ctx.shared());

    assert_eq!(surface.handle_key(' '), KeyAction::Injected);
    assert_eq!(surface.handle_key('s'), KeyAction::Ignored);
    assert_eq!(surface.handle_key('r'), KeyAction::TraceStarted);
    assert_eq!(surface.handle_key('r'), KeyAction::Ignored);
    assert_eq!(surface.handle_key('s'), KeyAction::TraceStopped);
    assert_eq!(surface.handle_key('x'), KeyAction::Ignored);
    assert!(!surface.shared().quit_requested());
    assert_eq!(surface.handle_key('\u{1b}'), KeyAction::Quit);
    assert!(surface.shared().quit_requested());
    assert!(dir.path().join("keys.vcd").exists());
}

#[test]
fn test_command_keys() {
    for key in ['q', '\u{1b}', ' ', 'r', 's'] {
        assert!(control::is_command_key(key), "{key:?}");
    }
    assert!(!control::is_command_key('a'));
}

#[test]
fn test_space_follows_configured_input_name() {
    let ctx = context(&spin());
    let config = ButtonConfig {
        name: "encoder".to_string(),
        ..ButtonConfig::default()
    };
    let input = ctx.attach_button(&config).unwrap();
    let surface = ControlSurface::new(ctx.shared()).with_button_input("encoder");

    assert_eq!(surface.handle_key(' '), KeyAction::Injected);
    assert_eq!(input.pending(), 1);
}

#[test]
fn test_trace_commands_while_running() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("live.vcd");
    let program = Asm::new()
        .addi(0, 1)
        .out(sig::PORTA, 0)
        .jmp(0);
    let ctx = context_with_trace(&program, &path, &["PORTA"]);
    let surface = ControlSurface::new(ctx.shared());
    let handle = sim::spawn(ctx).unwrap();

    surface.start_trace().unwrap();
    assert!(surface.start_trace().is_err());
    assert!(wait_until(Duration::from_secs(5), || surface.tick().steps > 1000));
    let records = surface.stop_trace().unwrap();
    surface.quit();
    handle.join();

    assert!(records > 0);
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with('b')).count() as u64, records + 1);
}

#[test]
fn test_tick_reports_signals_and_flags() {
    let program = Asm::new().ldi(0, 0xA5).out(sig::PORTB, 0).sleep();
    let ctx = context(&program);
    let surface = ControlSurface::new(ctx.shared());

    let report = sim::runner::run(ctx);
    let frame = surface.tick();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(frame.state, RunState::Done);
    assert_eq!(frame.steps, 3);
    assert_eq!(frame.cycles, 3);
    assert_eq!(frame.signals[1], ("PORTB", 0xA5));
    assert!(!frame.tracing);
    assert!(!frame.debugging);
}

#[test]
fn test_text_dashboard_prints_changes_only() {
    let program = Asm::new().ldi(0, 0x81).out(sig::PORTA, 0).sleep();
    let ctx = context(&program);
    let surface = ControlSurface::new(ctx.shared());
    sim::runner::run(ctx);
    let frame = surface.tick();

    let line = TextDashboard::<Vec<u8>>::line(&frame);
    assert!(line.starts_with("[done   ]"));
    assert!(line.contains("PORTA #......#"));
    assert!(line.contains("PORTB ........"));

    let out = SharedBuffer::default();
    let mut dashboard = TextDashboard::new(out.clone());
    dashboard.render(&frame).unwrap();
    dashboard.render(&frame).unwrap();
    assert_eq!(out.text().lines().count(), 1);

    NullRenderer.render(&frame).unwrap();
}
