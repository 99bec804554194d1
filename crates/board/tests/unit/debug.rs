//! # Remote Debug Tests
//!
//! Debugger requests serviced by the execution thread over the in-process
//! channel, and one full round trip through the TCP endpoint.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use mcuboard_core::common::DebugProtocolError;
use mcuboard_core::debug::gdb::{self, SRAM_BASE, signal};
use mcuboard_core::debug::{DebugClient, DebugGateway, DebugReply, DebugRequest, StopEvent};
use mcuboard_core::machine::RunState;
use mcuboard_core::sim::{self, ExecutionHandle, SharedState};
use pretty_assertions::assert_eq;

use crate::common::asm::{Asm, sig, spin};
use crate::common::harness::{context, wait_until};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns `program` with a debugger attached from the start.
fn debugged(program: &Asm) -> (ExecutionHandle, DebugClient, std::sync::Arc<SharedState>) {
    let mut ctx = context(program);
    let (link, client) = gdb::channel();
    ctx.attach_debugger(link);
    let shared = ctx.shared();
    (sim::spawn(ctx).unwrap(), client, shared)
}

fn pc_of(client: &DebugClient) -> u32 {
    match client.request(DebugRequest::ReadRegister(8)).unwrap() {
        DebugReply::Data(bytes) => u32::from_le_bytes(bytes.try_into().unwrap()),
        other => panic!("expected PC bytes, got {other:?}"),
    }
}

/// `ldi@0 out@3 ldi@6 out@9 sleep@12`
fn two_writes() -> Asm {
    Asm::new()
        .ldi(0, 1)
        .out(sig::PORTB, 0)
        .ldi(0, 2)
        .out(sig::PORTB, 0)
        .sleep()
}

#[test]
fn test_attached_machine_waits_stopped() {
    let (handle, client, shared) = debugged(&two_writes());

    thread::sleep(Duration::from_millis(30));

    assert_eq!(shared.run_state(), RunState::Stopped);
    assert!(shared.is_debug_attached());
    assert_eq!(shared.steps(), 0);
    assert!(!shared.resume(), "the debugger owns resumption");
    assert_eq!(
        client.request(DebugRequest::ReadRegisters).unwrap(),
        DebugReply::Data(vec![0; 12])
    );

    client.request(DebugRequest::Kill).unwrap();
    let report = handle.join();
    assert!(report.quit);
    assert_eq!(report.state, RunState::Stopped);
}

#[test]
fn test_breakpoint_step_and_exit() {
    let (handle, client, shared) = debugged(&two_writes());

    assert_eq!(client.request(DebugRequest::InsertBreakpoint(6)).unwrap(), DebugReply::Ok);
    assert_eq!(client.request(DebugRequest::Continue).unwrap(), DebugReply::Resumed);
    assert_eq!(
        client.next_stop(STOP_TIMEOUT).unwrap(),
        Some(StopEvent::Signal(signal::SIGTRAP))
    );
    assert_eq!(pc_of(&client), 6);
    assert_eq!(shared.signals().load(mcuboard_core::common::SignalId(1)), 1);
    assert_eq!(
        client.request(DebugRequest::ReadRegister(0)).unwrap(),
        DebugReply::Data(vec![1])
    );

    assert_eq!(client.request(DebugRequest::Step).unwrap(), DebugReply::Resumed);
    assert_eq!(
        client.next_stop(STOP_TIMEOUT).unwrap(),
        Some(StopEvent::Signal(signal::SIGTRAP))
    );
    assert_eq!(pc_of(&client), 9);

    client.request(DebugRequest::RemoveBreakpoint(6)).unwrap();
    client.request(DebugRequest::Continue).unwrap();
    assert_eq!(client.next_stop(STOP_TIMEOUT).unwrap(), Some(StopEvent::Exited(0)));

    let report = handle.join();
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.steps, 5);
    assert!(matches!(
        client.request(DebugRequest::ReadRegisters),
        Err(DebugProtocolError::Detached)
    ));
}

#[test]
fn test_memory_access() {
    let (handle, client, _) = debugged(&two_writes());

    assert_eq!(
        client
            .request(DebugRequest::ReadMemory { addr: 0, len: 3 })
            .unwrap(),
        DebugReply::Data(vec![0x10, 0, 1])
    );
    assert_eq!(
        client
            .request(DebugRequest::WriteMemory {
                addr: SRAM_BASE + 4,
                data: vec![0xDE, 0xAD],
            })
            .unwrap(),
        DebugReply::Ok
    );
    assert_eq!(
        client
            .request(DebugRequest::ReadMemory {
                addr: SRAM_BASE + 3,
                len: 4,
            })
            .unwrap(),
        DebugReply::Data(vec![0, 0xDE, 0xAD, 0])
    );
    assert_eq!(
        client
            .request(DebugRequest::ReadMemory {
                addr: SRAM_BASE + 0x1_0000,
                len: 1,
            })
            .unwrap(),
        DebugReply::Error
    );
    assert_eq!(
        client.request(DebugRequest::ReadRegister(42)).unwrap(),
        DebugReply::Error
    );

    client.request(DebugRequest::Kill).unwrap();
    handle.join();
}

#[test]
fn test_register_writes() {
    let (handle, client, _) = debugged(&two_writes());
    let write = |index, value: Vec<u8>| {
        client
            .request(DebugRequest::WriteRegister { index, value })
            .unwrap()
    };

    assert_eq!(write(3, vec![7]), DebugReply::Ok);
    assert_eq!(
        client.request(DebugRequest::ReadRegister(3)).unwrap(),
        DebugReply::Data(vec![7])
    );
    assert_eq!(write(3, vec![1, 2]), DebugReply::Error);
    assert_eq!(write(9, vec![1]), DebugReply::Error);

    assert_eq!(write(8, 12u32.to_le_bytes().to_vec()), DebugReply::Ok);
    assert_eq!(pc_of(&client), 12);
    client.request(DebugRequest::Continue).unwrap();
    assert_eq!(client.next_stop(STOP_TIMEOUT).unwrap(), Some(StopEvent::Exited(0)));

    let report = handle.join();
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.steps, 1, "execution resumed at the written PC");
}

#[test]
fn test_interrupt_stops_running_machine() {
    let (handle, client, shared) = debugged(&spin());

    client.request(DebugRequest::Continue).unwrap();
    assert!(wait_until(STOP_TIMEOUT, || shared.steps() > 100));
    assert_eq!(client.request(DebugRequest::Interrupt).unwrap(), DebugReply::Ok);

    assert_eq!(
        client.next_stop(STOP_TIMEOUT).unwrap(),
        Some(StopEvent::Signal(signal::SIGINT))
    );
    assert_eq!(shared.run_state(), RunState::Stopped);

    client.request(DebugRequest::Kill).unwrap();
    handle.join();
}

#[test]
fn test_crash_stops_for_debugger() {
    let (handle, client, shared) = debugged(&Asm::new().nop().jmp(0xFFF0));

    client.request(DebugRequest::Continue).unwrap();

    assert_eq!(
        client.next_stop(STOP_TIMEOUT).unwrap(),
        Some(StopEvent::Signal(signal::SIGSEGV))
    );
    assert_eq!(shared.run_state(), RunState::Stopped);
    assert_eq!(pc_of(&client), 0x1_0000);

    client.request(DebugRequest::Kill).unwrap();
    let report = handle.join();
    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(report.hooks_run, 0);
}

#[test]
fn test_detach_lets_machine_run() {
    let (handle, client, shared) = debugged(&two_writes());

    assert_eq!(client.request(DebugRequest::Detach).unwrap(), DebugReply::Ok);
    let report = handle.join();

    assert_eq!(report.state, RunState::Done);
    assert!(!shared.is_debug_attached());
}

#[test]
fn test_dropped_client_detaches() {
    let (handle, client, _) = debugged(&two_writes());

    drop(client);

    assert_eq!(handle.join().state, RunState::Done);
}

/// Reads from `stream` until `expected` bytes arrived.
fn read_exact_reply(stream: &mut TcpStream, expected: &str) -> String {
    let mut got = Vec::new();
    let mut buf = [0u8; 256];
    while got.len() < expected.len() {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "endpoint closed early");
        got.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(got).unwrap()
}

#[test]
fn test_tcp_endpoint_round_trip() {
    let mut ctx = context(&two_writes());
    let (link, client) = gdb::channel();
    ctx.attach_debugger(link);
    let shared = ctx.shared();
    let gateway = DebugGateway::spawn(0, client, ctx.shared()).unwrap();
    assert_eq!(shared.debug_endpoint(), Some(gateway.local_addr()));
    let handle = sim::spawn(ctx).unwrap();

    let mut stream = TcpStream::connect(gateway.local_addr()).unwrap();
    stream.set_read_timeout(Some(STOP_TIMEOUT)).unwrap();

    stream.write_all(b"$?#3f").unwrap();
    assert_eq!(read_exact_reply(&mut stream, "+$S05#b8"), "+$S05#b8");

    stream.write_all(b"+$g#67").unwrap();
    let regs = format!("+${}#80", "0".repeat(24));
    assert_eq!(read_exact_reply(&mut stream, &regs), regs);

    stream.write_all(b"+$D#44").unwrap();
    assert_eq!(read_exact_reply(&mut stream, "+$OK#9a"), "+$OK#9a");
    drop(stream);

    let report = handle.join();
    assert_eq!(report.state, RunState::Done);
    gateway.join();
}

#[test]
fn test_crash_opens_endpoint_without_prior_debugger() {
    let mut ctx = context(&Asm::new().nop().jmp(0xFFF0));
    ctx.set_crash_debug_port(Some(0));
    let shared = ctx.shared();
    let handle = sim::spawn(ctx).unwrap();

    assert!(wait_until(STOP_TIMEOUT, || shared.run_state() == RunState::Stopped));
    assert!(shared.is_debug_attached());
    assert!(!shared.resume(), "the debugger owns resumption");
    let addr = shared.debug_endpoint().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(STOP_TIMEOUT)).unwrap();
    stream.write_all(b"$?#3f").unwrap();
    assert_eq!(read_exact_reply(&mut stream, "+$S0b#e5"), "+$S0b#e5");

    stream.write_all(b"+$g#67").unwrap();
    let regs = format!("+${}00000100#81", "0".repeat(16));
    assert_eq!(read_exact_reply(&mut stream, &regs), regs);

    stream.write_all(b"+$k#6b").unwrap();
    assert_eq!(read_exact_reply(&mut stream, "+"), "+");
    let report = handle.join();

    assert!(report.quit);
    assert_eq!(report.state, RunState::Stopped);
    assert!(shared.is_finished());
    assert!(!shared.is_debug_attached());
}

#[test]
fn test_no_crash_endpoint_by_default_in_context() {
    let ctx = context(&Asm::new().nop().jmp(0xFFF0));
    let shared = ctx.shared();

    let report = sim::spawn(ctx).unwrap().join();

    assert_eq!(report.state, RunState::Crashed);
    assert_eq!(shared.debug_endpoint(), None);
}
