use nkpipe::CpuSet;

use super::{rig, rig_with};
use crate::arch::Arch;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::thread::{ExecMode, PeriodWait, ThreadSpec};

#[test]
fn registration_checks_placement() {
    let rig = rig(2);
    assert_eq!(
        rig.core.register_thread(ThreadSpec::new("far", 1).cpu(4)),
        Err(CoreError::InvalidArgument("cpu"))
    );
    assert_eq!(
        rig.core
            .register_thread(ThreadSpec::new("split", 1).cpu(0).affinity(CpuSet::single(1))),
        Err(CoreError::InvalidArgument("affinity"))
    );

    let tid = rig
        .core
        .register_thread(ThreadSpec::new("ok", 1).cpu(1).host(10, 20))
        .unwrap();
    let view = rig.core.thread_view(tid).unwrap();
    assert_eq!(view.name.as_str(), "ok");
    assert_eq!(view.mode, ExecMode::Relaxed);
    assert_eq!(view.cpu, 1);
    assert_eq!(view.affinity, CpuSet::first_n(2));
    assert_eq!(view.window_size, 64);
    assert_eq!((view.host.pid, view.host.process, view.host.cpu), (10, 20, 1));
    rig.core.atomic(|nk| {
        assert_eq!(nk.timer_cpu(view.rtimer).unwrap(), 1);
        assert_eq!(nk.timer_cpu(view.ptimer).unwrap(), 1);
    });
}

#[test]
fn highest_priority_ready_thread_runs() {
    let rig = rig(1);
    let low = rig.core.register_thread(ThreadSpec::new("low", 10)).unwrap();
    let high = rig.core.register_thread(ThreadSpec::new("high", 20)).unwrap();
    rig.core.atomic(|nk| {
        nk.harden(low).unwrap();
        assert_eq!(nk.current_thread(0), Some(low));
        nk.harden(high).unwrap();
        assert_eq!(nk.current_thread(0), Some(high));

        nk.suspend(high).unwrap();
        nk.sched_run();
        assert_eq!(nk.current_thread(0), Some(low));
        nk.resume(high).unwrap();
        assert!(nk.sched_run());
        assert_eq!(nk.current_thread(0), Some(high));

        nk.suspend(high).unwrap();
        nk.suspend(low).unwrap();
        nk.sched_run();
        assert_eq!(nk.current_thread(0), None);
    });
}

#[test]
fn delay_times_out_on_tick() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("sleeper", 10)).unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.delay(tid, 0).unwrap();
        assert!(!nk.thread_view(tid).unwrap().blocks.delayed);
        nk.delay(tid, 1_000).unwrap();
        nk.sched_run();
        assert_eq!(nk.current_thread(0), None);
    });

    rig.advance_to(1_000);
    rig.tick(0);
    rig.core.atomic(|nk| {
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.timeo);
        assert!(!view.blocks.delayed);
        assert_eq!(nk.current_thread(0), Some(tid));
    });
}

#[test]
fn unblock_breaks_the_wait() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("sleeper", 10)).unwrap();
    rig.core.atomic(|nk| {
        assert!(!nk.unblock(tid).unwrap());
        nk.harden(tid).unwrap();
        nk.delay(tid, 50_000).unwrap();
        assert!(nk.unblock(tid).unwrap());
        let view = nk.thread_view(tid).unwrap();
        assert!(view.info.broken && !view.info.timeo);
        assert!(!nk.timer_is_running(view.rtimer).unwrap());
    });
}

#[test]
fn periodic_release_and_overruns() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("cyclic", 10)).unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.set_periodic(tid, None, Some(1_000)).unwrap();
        assert_eq!(nk.wait_period(tid).unwrap(), PeriodWait::Suspended);
        assert_eq!(nk.finish_wait_period(tid), Err(CoreError::WouldBlock));
        nk.sched_run();
        assert_eq!(nk.current_thread(0), None);
    });

    rig.advance_to(1_000);
    rig.tick(0);
    rig.core.atomic(|nk| {
        assert_eq!(nk.current_thread(0), Some(tid));
        assert_eq!(nk.finish_wait_period(tid).unwrap(), 0);
    });

    // Late by two and a half periods.
    rig.advance_to(4_500);
    rig.core.atomic(|nk| {
        assert_eq!(nk.wait_period(tid).unwrap(), PeriodWait::Elapsed(2));
        let ptimer = nk.thread_view(tid).unwrap().ptimer;
        assert_eq!(nk.timer_get_date(ptimer).unwrap(), Some(5_000));
    });
}

#[test]
fn debugger_hides_overruns_once() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("cyclic", 10)).unwrap();
    rig.core.atomic(|nk| {
        nk.harden(tid).unwrap();
        nk.set_periodic(tid, None, Some(1_000)).unwrap();
        nk.register_debugged(tid).unwrap();
        nk.unregister_debugged(tid).unwrap();
        assert!(nk.thread_view(tid).unwrap().info.hiccup);
    });
    rig.advance_to(3_500);
    rig.core.atomic(|nk| {
        assert_eq!(nk.wait_period(tid).unwrap(), PeriodWait::Elapsed(0));
        assert!(!nk.thread_view(tid).unwrap().info.hiccup);
    });
    rig.advance_to(6_200);
    rig.core.atomic(|nk| {
        assert_eq!(nk.wait_period(tid).unwrap(), PeriodWait::Elapsed(2));
    });
}

#[test]
fn broken_period_wait_is_interrupted() {
    let rig = rig(1);
    let tid = rig.core.register_thread(ThreadSpec::new("cyclic", 10)).unwrap();
    rig.core.atomic(|nk| {
        assert_eq!(nk.wait_period(tid), Err(CoreError::WouldBlock));
        nk.set_periodic(tid, Some(5_000), Some(1_000)).unwrap();
        let ptimer = nk.thread_view(tid).unwrap().ptimer;
        assert_eq!(nk.timer_get_date(ptimer).unwrap(), Some(5_000));

        assert_eq!(nk.wait_period(tid).unwrap(), PeriodWait::Suspended);
        assert!(nk.unblock(tid).unwrap());
        assert_eq!(nk.finish_wait_period(tid), Err(CoreError::Interrupted));

        nk.set_periodic(tid, None, None).unwrap();
        assert_eq!(nk.wait_period(tid), Err(CoreError::WouldBlock));
    });
}

#[test]
fn period_shorter_than_gravity_is_refused() {
    let config = CoreConfig::builder()
        .arch(Arch::X86_64)
        .watchdog_timeout(None)
        .build();
    let rig = rig_with(1, config);
    let user = rig.core.register_thread(ThreadSpec::new("user", 10)).unwrap();
    let kernel = rig
        .core
        .register_thread(ThreadSpec::new("kernel", 10).kernel())
        .unwrap();
    rig.core.atomic(|nk| {
        assert_eq!(
            nk.set_periodic(user, None, Some(1_000)),
            Err(CoreError::InvalidArgument("period below gravity"))
        );
        nk.set_periodic(user, None, Some(4_000)).unwrap();
        // Kernel threads fall back to the user tier on x86_64.
        assert!(nk.set_periodic(kernel, None, Some(3_999)).is_err());
    });
}
