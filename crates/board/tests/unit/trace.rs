//! # Trace Session Tests
//!
//! VCD header and body format, the single-session rule of the gateway, and
//! changes reaching the file while the execution thread steps.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mcuboard_core::common::{SignalChange, SignalId, TraceError};
use mcuboard_core::control::{ControlSurface, KeyAction};
use mcuboard_core::debug::{TraceGateway, TraceSession, TraceSettings};
use mcuboard_core::machine::SignalBank;
use mcuboard_core::sim::runner;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

use crate::common::asm::{Asm, sig};
use crate::common::harness::{FREQUENCY, SharedBuffer, context_with_trace};

const NAMES: &[&str] = &["PORTA", "PORTB", "ADC", "UART0.RX"];

fn porta(new: u32) -> SignalChange {
    SignalChange {
        id: SignalId(0),
        old: 0,
        new,
    }
}

fn gateway(path: std::path::PathBuf) -> TraceGateway {
    TraceGateway::new(
        Arc::new(SignalBank::new(NAMES)),
        TraceSettings {
            path,
            signals: Vec::new(),
            frequency: FREQUENCY,
        },
    )
}

#[test]
fn test_session_header_and_changes() {
    let bank = SignalBank::new(NAMES);
    let buffer = SharedBuffer::default();
    let mut session = TraceSession::open(
        Box::new(buffer.clone()),
        &bank,
        &["PORTA".to_string()],
        FREQUENCY,
        0,
    )
    .unwrap();

    session.record(3, porta(5)).unwrap();
    session.record(3, porta(6)).unwrap();
    session
        .record(
            4,
            SignalChange {
                id: SignalId(1),
                old: 0,
                new: 1,
            },
        )
        .unwrap();
    assert_eq!(session.close().unwrap(), 2);

    let expected = "\
$timescale 1ns $end
$scope module board $end
$var wire 8 ! PORTA $end
$upscope $end
$enddefinitions $end
#0
$dumpvars
b00000000 !
$end
#3000
b00000101 !
b00000110 !
";
    assert_eq!(buffer.text(), expected);
}

#[test]
fn test_session_widths_and_names() {
    let bank = SignalBank::new(NAMES);
    let buffer = SharedBuffer::default();
    let session = TraceSession::open(Box::new(buffer.clone()), &bank, &[], FREQUENCY, 0).unwrap();
    session.close().unwrap();

    let text = buffer.text();
    assert!(text.contains("$var wire 10 # ADC $end"));
    assert!(text.contains("$var wire 9 $ UART0_RX $end"));
    assert!(text.contains("b0000000000 #"));
}

#[test]
fn test_second_start_is_rejected_without_touching_sink() {
    let trace = gateway("unused.vcd".into());
    let first = SharedBuffer::default();
    let sink = first.clone();
    trace.start_with(0, move || Ok(Box::new(sink))).unwrap();
    trace.record(10, porta(1));
    let before = first.contents();

    let opened = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&opened);
    let err = trace
        .start_with(20, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(Box::new(SharedBuffer::default()))
        })
        .unwrap_err();

    assert!(matches!(err, TraceError::AlreadyActive));
    assert!(!opened.load(Ordering::SeqCst), "second sink must not be opened");
    assert!(trace.is_active());
    assert_eq!(first.contents(), before);
    assert_eq!(trace.stop().unwrap(), 1);
}

#[test]
fn test_stop_without_session_is_not_active() {
    let trace = gateway("unused.vcd".into());

    assert!(matches!(trace.stop(), Err(TraceError::NotActive)));
    trace.close();
    assert!(!trace.is_active());
}

#[test]
fn test_stop_then_start_truncates_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.vcd");
    let trace = gateway(path.clone());

    trace.start(0).unwrap();
    trace.record(1, porta(1));
    trace.record(2, porta(2));
    assert_eq!(trace.stop().unwrap(), 2);
    let first = fs::read_to_string(&path).unwrap();
    assert!(first.contains("#2000\nb00000010 !"));

    trace.start(5).unwrap();
    assert_eq!(trace.stop().unwrap(), 0);
    let second = fs::read_to_string(&path).unwrap();
    assert!(second.starts_with("$timescale"));
    assert!(second.contains("#5000\n$dumpvars"));
    assert!(!second.contains("b00000010 !"));
}

#[test]
fn test_unopenable_file_leaves_gateway_inactive() {
    let dir = tempdir().unwrap();
    let trace = gateway(dir.path().join("missing").join("trace.vcd"));

    assert!(matches!(trace.start(0), Err(TraceError::Sink(_))));
    assert!(!trace.is_active());
}

#[test]
fn test_trace_records_port_writes_while_running() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.vcd");
    let program = Asm::new()
        .ldi(0, 0x01)
        .out(sig::PORTB, 0)
        .ldi(0, 0x80)
        .out(sig::PORTB, 0)
        .sleep();
    let ctx = context_with_trace(&program, &path, &["PORTB"]);
    ctx.shared().trace().start(0).unwrap();

    let report = runner::run(ctx);

    assert_eq!(report.steps, 5);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("$var wire 8 \" PORTB $end"));
    assert!(text.contains("#1000\nb00000001 \""));
    assert!(text.contains("#3000\nb10000000 \""));
}

#[test]
fn test_trace_refused_after_execution_thread_finishes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("late.vcd");
    let ctx = context_with_trace(&Asm::new().sleep(), &path, &[]);
    let shared = ctx.shared();
    let surface = ControlSurface::new(Arc::clone(&shared));

    runner::run(ctx);

    assert!(shared.is_finished());
    assert!(shared.trace().is_closed());
    assert!(matches!(shared.trace().start(0), Err(TraceError::Closed)));
    assert_eq!(surface.handle_key('r'), KeyAction::Ignored);
    assert!(!shared.trace().is_active());
    assert!(!path.exists(), "no sink is opened once tracing is closed");
}

#[test]
fn test_sink_opens_without_blocking_recorder() {
    let trace = gateway("unused.vcd".into());
    let buffer = SharedBuffer::default();
    let sink = buffer.clone();

    trace
        .start_with(0, || {
            trace.record(1, porta(9));
            assert!(matches!(
                trace.start_with(0, || Ok(Box::new(SharedBuffer::default()))),
                Err(TraceError::AlreadyActive)
            ));
            Ok(Box::new(sink))
        })
        .unwrap();

    assert!(trace.is_active());
    trace.record(2, porta(3));
    assert_eq!(trace.stop().unwrap(), 1);
    assert!(buffer.text().contains("#2000\nb00000011 !"));
}

#[test]
fn test_close_while_opening_discards_session() {
    let trace = gateway("unused.vcd".into());

    let err = trace
        .start_with(0, || {
            trace.close();
            Ok(Box::new(SharedBuffer::default()))
        })
        .unwrap_err();

    assert!(matches!(err, TraceError::Closed));
    assert!(!trace.is_active());
    assert!(matches!(trace.stop(), Err(TraceError::NotActive)));
}
