use nkpipe::sim::IpiKind;
use nkpipe::CpuSet;

use super::{rig, rig_with};
use crate::arch::Arch;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::modeswitch::{SyscallMode, Trap, TrapKind};
use crate::thread::{ExecMode, HostWake, RelaxReason, SigSet, ThreadSpec};

#[test]
fn harden_and_relax() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).host(100, 100))
        .unwrap();
    assert_eq!(rig.core.thread_view(tid).unwrap().mode, ExecMode::Relaxed);

    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        assert_eq!(nk.thread_mode(tid).unwrap(), ExecMode::Primary);
        assert_eq!(nk.current_thread(0), Some(tid));
        nk.harden(tid).unwrap();
    });
    assert_eq!(rig.hw.migrations(), (1, 0));

    rig.core.atomic(|nk| {
        nk.relax(tid, true, RelaxReason::Syscall).unwrap();
        nk.relax(tid, true, RelaxReason::Fault).unwrap();
        assert_eq!(nk.current_thread(0), None);
    });
    let view = rig.core.thread_view(tid).unwrap();
    assert_eq!(view.mode, ExecMode::Relaxed);
    assert_eq!(view.last_relax, Some(RelaxReason::Syscall));
    assert_eq!(view.stats.ssw, 1);
    assert_eq!(view.stats.csw, 1);
    assert!(view.host.signals.is_empty());
    assert_eq!(rig.hw.migrations(), (1, 1));

    // Wake-ups reach the host once the in-band stage runs.
    assert!(rig.core.take_host_wakeups().is_empty());
    assert_eq!(rig.hw.run_inband(), 1);
    assert_eq!(
        rig.core.take_host_wakeups(),
        [HostWake {
            thread: tid,
            pid: 100,
            reason: RelaxReason::Syscall,
        }]
    );
}

#[test]
fn warned_thread_gets_sigdebug() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).warn())
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.relax(tid, true, RelaxReason::Syscall).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert!(view.host.signals.contains(SigSet::SIGDEBUG));
        assert_eq!(view.host.sigdebug, Some(RelaxReason::Syscall));

        // Nothing goes back out-of-band until the host delivered it.
        assert_eq!(nk.harden(tid), Err(CoreError::RestartSyscall));
        nk.clear_host_signals(tid).unwrap();
        nk.harden(tid).unwrap();
    });
}

#[test]
fn harden_failures_leave_thread_relaxed() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();

    rig.hw.fail_next_leave_inband();
    rig.core.atomic(|nk| {
        assert_eq!(nk.harden(tid), Err(CoreError::RestartSyscall));
        assert_eq!(nk.thread_mode(tid).unwrap(), ExecMode::Relaxed);
    });
    assert_eq!(rig.hw.migrations(), (0, 0));

    rig.core.atomic(|nk| {
        nk.handle_sigwake(tid, SigSet::SIGINT).unwrap();
        assert_eq!(nk.harden(tid), Err(CoreError::RestartSyscall));
        assert_eq!(nk.thread_mode(tid).unwrap(), ExecMode::Relaxed);
        assert_eq!(nk.harden(crate::ThreadId(999)), Err(CoreError::NotPermitted));
    });
}

#[test]
fn harden_on_non_realtime_cpu_cancels() {
    let config = CoreConfig::builder()
        .watchdog_timeout(None)
        .rt_cpus(CpuSet::single(0))
        .build();
    let rig = rig_with(2, config);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    rig.core.atomic(|nk| {
        nk.host_migrate(tid, 1).unwrap();
        assert_eq!(nk.harden(tid), Err(CoreError::Canceled));
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert!(view.info.canceled);
    });
    assert_eq!(rig.hw.migrations(), (1, 1));
}

#[test]
fn harden_follows_host_migration() {
    let rig = rig(2);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    let rtimer = rig.core.thread_view(tid).unwrap().rtimer;
    rig.core.atomic(|nk| {
        nk.host_migrate(tid, 1).unwrap();
        nk.harden(tid).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.cpu, 1);
        assert!(view.info.moved);
        assert_eq!(nk.timer_cpu(rtimer).unwrap(), 1);
        // Picked up by CPU1 on its next scheduling pass.
        assert_eq!(nk.current_thread(1), None);
    });
    let ipis = rig.hw.take_ipis();
    assert!(ipis
        .iter()
        .any(|ipi| ipi.kind == IpiKind::Resched && ipi.cpus == CpuSet::single(1)));

    rig.hw.set_current_cpu(1);
    rig.core.handle_irq(rig.core.ipi_irqs().1);
    rig.core.atomic(|nk| assert_eq!(nk.current_thread(1), Some(tid)));
}

#[test]
fn exit_while_running_leaves_zombie() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    let idle = rig.core.register_thread(ThreadSpec::new("idle", 1)).unwrap();
    let rtimer = rig.core.thread_view(tid).unwrap().rtimer;
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.handle_task_exit(tid).unwrap();
        assert_eq!(nk.thread_mode(tid).unwrap(), ExecMode::Terminated);
        assert_eq!(nk.thread_view(tid).unwrap().window_size, 0);
        assert_eq!(nk.current_thread(0), Some(tid));
        assert_eq!(nk.timer_status(rtimer), Err(CoreError::NotFound));
        assert_eq!(nk.harden(tid), Err(CoreError::NotPermitted));

        assert!(nk.sched_run());
        assert_eq!(nk.current_thread(0), None);
        assert_eq!(nk.thread_view(tid).err(), Some(CoreError::NotFound));

        // Not running: gone at once.
        nk.handle_task_exit(idle).unwrap();
        assert_eq!(nk.thread_view(idle).err(), Some(CoreError::NotFound));
    });
}

#[test]
fn kick_breaks_a_sleeping_thread() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).host(42, 42))
        .unwrap();
    let rtimer = rig.core.thread_view(tid).unwrap().rtimer;
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.delay(tid, 1_000).unwrap();
        nk.sched_run();
        assert_eq!(nk.current_thread(0), None);
        assert!(nk.timer_is_running(rtimer).unwrap());

        nk.kick(tid);
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.kicked && view.info.broken);
        assert!(!view.blocks.delayed);
        assert_eq!(view.pending_mayday, Some(RelaxReason::Signal));
        assert!(!nk.timer_is_running(rtimer).unwrap());
    });
    assert_eq!(rig.hw.take_maydays(), [42]);

    rig.core.atomic(|nk| {
        nk.handle_mayday(tid).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert_eq!(view.last_relax, Some(RelaxReason::Signal));
        assert_eq!(view.pending_mayday, None);
        // Relaxed threads ignore kicks.
        nk.kick(tid);
        assert!(!nk.thread_view(tid).unwrap().info.kicked);
    });
}

#[test]
fn kicked_running_thread_never_sleeps() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).host(42, 42))
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.kick(tid);
        nk.delay(tid, 1_000).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert!(!view.blocks.delayed);
        assert!(view.info.broken);
        assert_eq!(view.pending_mayday, None);
    });
    assert!(rig.hw.take_maydays().is_empty());
}

#[test]
fn signal_restarts_interrupted_syscall() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).warn())
        .unwrap();
    let map = Arch::Host.abi();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.set_host_sleeping(tid, true).unwrap();
        nk.handle_sigwake(tid, SigSet::SIGINT).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.kicked);
        assert!(view.host.nowakeup);

        nk.syscall_return(tid, Ok(5)).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert!(view.info.sysrst);
        assert!(!view.info.kicked);
        assert!(!view.host.nowakeup);
        assert!(view.host.signals.contains(SigSet::SIGDEBUG));
        assert_eq!(view.last_relax, Some(RelaxReason::Signal));
        assert_eq!(
            nk.thread_context(tid).unwrap().retval(map),
            (-512i64) as u64
        );
    });
}

#[test]
fn signal_wake_is_held_until_relax() {
    let rig = rig(1);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).host(42, 42))
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.set_host_sleeping(tid, true).unwrap();
        nk.handle_sigwake(tid, SigSet::SIGINT).unwrap();
        assert!(nk.thread_view(tid).unwrap().host.nowakeup);
    });
    rig.hw.run_inband();
    assert!(rig.core.take_host_wakeups().is_empty());

    rig.core.atomic(|nk| {
        nk.handle_mayday(tid).unwrap();
        assert!(!nk.thread_view(tid).unwrap().host.nowakeup);
    });
    rig.hw.run_inband();
    assert_eq!(
        rig.core.take_host_wakeups(),
        [HostWake {
            thread: tid,
            pid: 42,
            reason: RelaxReason::Signal,
        }]
    );
}

#[test]
fn plain_syscall_return_stores_result() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    let map = Arch::Host.abi();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.syscall_return(tid, Ok(7)).unwrap();
        assert_eq!(nk.thread_context(tid).unwrap().retval(map), 7);
        nk.syscall_return(tid, Err(CoreError::TimedOut)).unwrap();
        assert_eq!(
            nk.thread_context(tid).unwrap().retval(map),
            (-110i64) as u64
        );
        assert_eq!(nk.thread_mode(tid).unwrap(), ExecMode::Primary);

        // Saved with the thread when it switches out.
        nk.relax(tid, false, RelaxReason::Syscall).unwrap();
        assert_eq!(nk.thread_view(tid).unwrap().ctx.retval(map), (-110i64) as u64);
    });
}

#[test]
fn debugger_stops_the_whole_process() {
    let rig = rig(2);
    let a = rig
        .core
        .register_thread(ThreadSpec::new("a", 10).host(1, 7))
        .unwrap();
    let b = rig
        .core
        .register_thread(ThreadSpec::new("b", 10).cpu(1).host(2, 7))
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(a).unwrap();
        nk.harden(b).unwrap();
        nk.set_ptraced(a, true).unwrap();
        nk.handle_sigwake(a, SigSet::SIGSTOP).unwrap();

        let va = nk.thread_view(a).unwrap();
        assert!(va.state.sstep && va.info.conthi && va.info.kicked);
        assert!(nk.thread_view(b).unwrap().blocks.dbgstop);

        // The stopped thread drops to the host without a diagnostic.
        nk.syscall_return(a, Ok(0)).unwrap();
        let va = nk.thread_view(a).unwrap();
        assert_eq!(va.mode, ExecMode::Relaxed);
        assert!(!va.blocks.dbgstop);
        assert!(!va.host.signals.contains(SigSet::SIGDEBUG));

        nk.clear_host_signals(a).unwrap();
        nk.handle_ptrace_resume(a, true).unwrap();
        assert!(nk.thread_view(a).unwrap().state.sstep);
        nk.handle_ptrace_resume(a, false).unwrap();

        let vb = nk.thread_view(b).unwrap();
        assert!(!vb.blocks.dbgstop);
        assert!(vb.info.hiccup);
        let va = nk.thread_view(a).unwrap();
        assert!(!va.state.sstep);
        assert!(va.info.harden_pending);

        nk.return_to_user(a).unwrap();
        assert_eq!(nk.thread_mode(a).unwrap(), ExecMode::Primary);
        assert!(!nk.thread_view(a).unwrap().info.harden_pending);
    });
}

#[test]
fn traps_relax_primary_threads() {
    let rig = rig(1);
    let user = rig
        .core
        .register_thread(ThreadSpec::new("user", 10).warn())
        .unwrap();
    let kernel = rig
        .core
        .register_thread(ThreadSpec::new("kernel", 5).kernel().warn())
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(user).unwrap();
        assert!(!nk.handle_trap(user, Trap::new(TrapKind::Fpu)).unwrap());
        assert_eq!(nk.thread_mode(user).unwrap(), ExecMode::Primary);

        assert!(nk.handle_trap(user, Trap::new(TrapKind::PageFault)).unwrap());
        let view = nk.thread_view(user).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert_eq!(view.last_relax, Some(RelaxReason::Fault));
        assert_eq!(view.stats.pf, 1);
        assert!(view.host.signals.contains(SigSet::SIGDEBUG));

        // Already relaxed: the host deals with it.
        assert!(!nk.handle_trap(user, Trap::new(TrapKind::PageFault)).unwrap());
        assert_eq!(nk.thread_view(user).unwrap().stats.pf, 2);

        nk.harden(kernel).unwrap();
        assert!(nk.handle_trap(kernel, Trap::new(TrapKind::General)).unwrap());
        let view = nk.thread_view(kernel).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert!(view.host.signals.is_empty());
    });
}

#[test]
fn syscall_entry_switches_stage() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    rig.core.atomic(|nk| {
        assert_eq!(
            nk.syscall_entry(tid, SyscallMode::Current).unwrap(),
            ExecMode::Relaxed
        );
        assert_eq!(
            nk.syscall_entry(tid, SyscallMode::Conforming).unwrap(),
            ExecMode::Primary
        );
        assert_eq!(
            nk.syscall_entry(tid, SyscallMode::Primary).unwrap(),
            ExecMode::Primary
        );
        assert_eq!(
            nk.syscall_entry(tid, SyscallMode::Secondary).unwrap(),
            ExecMode::Relaxed
        );
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.stats.xsc, 4);
        assert_eq!(view.last_relax, Some(RelaxReason::Syscall));
        assert_eq!(
            nk.syscall_entry(crate::ThreadId(77), SyscallMode::Current),
            Err(CoreError::NotFound)
        );
    });
}

#[test]
fn affinity_change_moves_relaxed_thread() {
    let rig = rig(2);
    let tid = rig.core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    rig.core.atomic(|nk| {
        nk.handle_setaffinity(tid, CpuSet::from_bits(0b1110)).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.cpu, 1);
        assert_eq!(view.affinity, CpuSet::single(1));

        nk.handle_setaffinity(tid, CpuSet::single(5)).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert!(view.affinity.is_empty());
        assert_eq!(view.cpu, 1);
    });
}

#[test]
fn primary_thread_moved_by_host_is_kicked() {
    let rig = rig(2);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("rt", 10).host(9, 9))
        .unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.host_migrate(tid, 1).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.kicked);
        assert_eq!(view.host.cpu, 1);
        assert_eq!(view.cpu, 0);
    });
}

#[test]
fn watchdog_relaxes_runaway_thread() {
    let config = CoreConfig::builder().watchdog_timeout(Some(2)).build();
    let rig = rig_with(1, config);
    let tid = rig
        .core
        .register_thread(ThreadSpec::new("hog", 10).host(55, 55))
        .unwrap();
    rig.core.atomic(|nk| nk.harden(tid).unwrap());

    rig.advance_to(1_000_000_000);
    rig.tick(0);
    assert!(rig.hw.take_maydays().is_empty());
    rig.core.atomic(|nk| assert_eq!(nk.sched_view(0).unwrap().wdcount, 1));

    rig.advance_to(2_000_000_000);
    rig.tick(0);
    assert_eq!(rig.hw.take_maydays(), [55]);
    rig.core.atomic(|nk| {
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.kicked);
        assert_eq!(view.pending_mayday, Some(RelaxReason::Watchdog));
        assert_eq!(view.host.sigdebug, Some(RelaxReason::Watchdog));

        nk.handle_mayday(tid).unwrap();
        let view = nk.thread_view(tid).unwrap();
        assert_eq!(view.mode, ExecMode::Relaxed);
        assert_eq!(view.last_relax, Some(RelaxReason::Watchdog));
    });
}
