//! # Execution Thread Tests
//!
//! Terminal states, quit handling, and the exactly-once teardown sequence on
//! every exit path.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mcuboard_core::devices;
use mcuboard_core::machine::RunState;
use mcuboard_core::sim::{self, runner};
use rstest::rstest;

use crate::common::asm::{Asm, sig, spin};
use crate::common::harness::{context, wait_finished, wait_until};
use crate::common::mocks::{CountingHook, Counters, Faulty, Recorder};

/// Context with a counting hook and a recorder bound to `PORTB`.
fn instrumented(program: &Asm) -> (mcuboard_core::SimContext, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let mut ctx = context(program);
    ctx.install_hook(Box::new(CountingHook::new(&counters)))
        .unwrap();
    let model = devices::shared(Recorder::new(&counters));
    ctx.attach_peripheral("PORTB", &model).unwrap();
    (ctx, counters)
}

#[rstest]
#[case::halt(Asm::new().nop().sleep(), RunState::Done)]
#[case::software_break(Asm::new().nop().nop().brk().sleep(), RunState::Stopped)]
#[case::crash(Asm::new().nop().jmp(0xFFF0), RunState::Crashed)]
fn test_loop_ends_in_state(#[case] program: Asm, #[case] expected: RunState) {
    let (ctx, counters) = instrumented(&program);
    let shared = ctx.shared();

    let handle = sim::spawn(ctx).unwrap();
    if expected == RunState::Stopped {
        assert!(wait_until(Duration::from_secs(5), || {
            shared.run_state() == RunState::Stopped
        }));
        shared.request_quit();
    }
    let report = handle.join();

    assert_eq!(report.state, expected);
    assert_eq!(report.hooks_run, 1);
    assert_eq!(report.torn_down, 1);
    assert_eq!(Counters::get(&counters.inits), 1);
    assert_eq!(Counters::get(&counters.deinits), 1);
    assert_eq!(Counters::get(&counters.teardowns), 1);
    assert!(shared.is_finished());
}

#[test]
fn test_done_races_quit_and_tears_down_once() {
    let program = Asm::new()
        .ldi(0, 200)
        .addi(0, 0xFF)
        .brnz(0, 3)
        .sleep();
    let (ctx, counters) = instrumented(&program);
    let shared = ctx.shared();

    let handle = sim::spawn(ctx).unwrap();
    let quitters: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for _ in 0..50 {
                    shared.request_quit();
                }
            })
        })
        .collect();
    for quitter in quitters {
        quitter.join().unwrap();
    }
    let report = handle.join();

    assert!(matches!(report.state, RunState::Done | RunState::Running));
    assert_eq!(report.hooks_run, 1);
    assert_eq!(report.torn_down, 1);
    assert_eq!(Counters::get(&counters.deinits), 1);
    assert_eq!(Counters::get(&counters.teardowns), 1);
}

#[test]
fn test_quit_ends_running_machine() {
    let (ctx, counters) = instrumented(&spin());
    let shared = ctx.shared();
    let handle = sim::spawn(ctx).unwrap();

    assert!(wait_until(Duration::from_secs(5), || shared.steps() > 100));
    shared.request_quit();
    shared.request_quit();
    let report = handle.join();

    assert!(report.quit);
    assert_eq!(report.state, RunState::Running);
    assert!(report.steps > 100);
    assert_eq!(Counters::get(&counters.deinits), 1);
}

#[test]
fn test_quit_wakes_stopped_machine() {
    let (ctx, counters) = instrumented(&spin());
    ctx.machine().set_run_state(RunState::Stopped);
    let shared = ctx.shared();
    let handle = sim::spawn(ctx).unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(shared.steps(), 0);
    shared.request_quit();

    assert!(wait_finished(&handle));
    let report = handle.join();
    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(report.steps, 0);
    assert_eq!(Counters::get(&counters.deinits), 1);
}

#[test]
fn test_resume_after_software_breakpoint() {
    let program = Asm::new().ldi(0, 3).out(sig::PORTB, 0).brk().sleep();
    let (ctx, _) = instrumented(&program);
    let shared = ctx.shared();
    let handle = sim::spawn(ctx).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        shared.run_state() == RunState::Stopped
    }));
    assert_eq!(shared.signals().load(mcuboard_core::common::SignalId(1)), 3);
    assert!(shared.resume());

    let report = handle.join();
    assert_eq!(report.state, RunState::Done);
    assert!(!report.quit);
    assert_eq!(report.steps, 4);
}

#[test]
fn test_resume_only_leaves_stopped() {
    let ctx = context(&Asm::new().sleep());
    let shared = ctx.shared();

    assert!(!shared.resume(), "running machine has nothing to resume");
    let report = runner::run(ctx);
    assert_eq!(report.state, RunState::Done);
    assert!(!shared.resume(), "terminal states are final");
    assert_eq!(shared.run_state(), RunState::Done);
}

#[test]
fn test_failing_deinit_is_reported() {
    let counters = Arc::new(Counters::default());
    let mut ctx = context(&Asm::new().sleep());
    let mut hook = CountingHook::new(&counters);
    hook.fail_deinit = true;
    ctx.install_hook(Box::new(hook)).unwrap();
    ctx.install_hook(Box::new(CountingHook::new(&counters)))
        .unwrap();

    let report = runner::run(ctx);

    assert_eq!(report.hooks_run, 2);
    assert_eq!(report.deinit_failures.len(), 1);
    assert_eq!(Counters::get(&counters.deinits), 2, "teardown carries on");
}

#[test]
fn test_shutdown_is_idempotent() {
    let (mut ctx, counters) = instrumented(&Asm::new().sleep());

    let first = ctx.shutdown();
    let second = ctx.shutdown();

    assert_eq!(first.hooks_run, 1);
    assert_eq!(first.torn_down, 1);
    assert_eq!(second.hooks_run, 0);
    assert_eq!(second.torn_down, 0);
    assert_eq!(Counters::get(&counters.deinits), 1);
    assert!(ctx.shared().is_finished());
}

#[test]
fn test_dropped_handle_thread_still_tears_down() {
    let (ctx, counters) = instrumented(&Asm::new().nop().sleep());
    let shared = ctx.shared();

    drop(sim::spawn(ctx).unwrap());

    assert!(wait_until(Duration::from_secs(5), || shared.is_finished()));
    assert_eq!(Counters::get(&counters.deinits), 1);
}

#[test]
fn test_panicked_thread_reports_its_teardown() {
    let counters = Arc::new(Counters::default());
    let mut ctx = context(&spin());
    let mut hook = CountingHook::new(&counters);
    hook.fail_deinit = true;
    ctx.install_hook(Box::new(hook)).unwrap();
    let model = devices::shared(Faulty::new(&counters, 3));
    ctx.attach_peripheral("PORTB", &model).unwrap();
    let shared = ctx.shared();

    let report = sim::spawn(ctx).unwrap().join();

    assert_eq!(report.state, RunState::Crashed);
    assert_eq!(report.steps, 2);
    assert_eq!(report.hooks_run, 1);
    assert_eq!(report.deinit_failures.len(), 1);
    assert_eq!(report.torn_down, 1);
    assert_eq!(Counters::get(&counters.deinits), 1);
    assert_eq!(Counters::get(&counters.teardowns), 1);
    assert!(shared.is_finished());
}
