use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nkpipe::CpuSet;

use super::{rig, TestDevice};
use crate::clock::{ClockId, Gravity};
use crate::error::CoreError;
use crate::kernel::Locked;
use crate::timer::{GravityTier, TimerHandler, TimerId, TimerMode};

const CORE: ClockId = ClockId::CORE;

fn noop() -> TimerHandler {
    Box::new(|_: &mut Locked<'_>, _: TimerId| {})
}

#[test]
fn extension_clock_affinity() {
    let rig = rig(2);
    let dev = TestDevice::default();
    assert_eq!(
        rig.core
            .register_clock("ext", Box::new(dev.clone()), Some(CpuSet::empty())),
        Err(CoreError::InvalidArgument("clock affinity"))
    );
    assert_eq!(
        rig.core
            .register_clock("ext", Box::new(dev.clone()), Some(CpuSet::single(5))),
        Err(CoreError::InvalidArgument("clock affinity"))
    );
    let id = rig
        .core
        .register_clock("ext", Box::new(dev), Some(CpuSet::from_bits(0b110)))
        .unwrap();
    assert_eq!(rig.core.clock_by_name("ext"), Some(id));
    rig.core.atomic(|nk| {
        assert_eq!(nk.clock_affinity(id).unwrap(), CpuSet::single(1));
        assert_eq!(nk.clock_frequency(id).unwrap(), 1_000_000);
        assert_eq!(nk.clock_resolution(id).unwrap(), 1_000);
    });
}

#[test]
fn core_clock_cannot_go() {
    let rig = rig(1);
    assert_eq!(
        rig.core.deregister_clock(CORE),
        Err(CoreError::InvalidArgument("core clock"))
    );

    let id = rig
        .core
        .register_clock("ext", Box::new(TestDevice::default()), None)
        .unwrap();
    rig.core.deregister_clock(id).unwrap();
    assert_eq!(rig.core.deregister_clock(id), Err(CoreError::NotFound));
    rig.core.atomic(|nk| {
        assert_eq!(nk.read_raw(id), Err(CoreError::NotFound));
        assert!(matches!(
            nk.timer_init(id, "stale", GravityTier::User, noop()),
            Err(CoreError::NotFound)
        ));
    });
}

#[test]
#[should_panic(expected = "queued timers")]
fn deregistering_busy_clock_panics() {
    let rig = rig(1);
    let id = rig
        .core
        .register_clock("busy", Box::new(TestDevice::default()), None)
        .unwrap();
    rig.core.atomic(|nk| {
        let tid = nk.timer_init(id, "t", GravityTier::User, noop()).unwrap();
        nk.timer_start(tid, 1_000_000, None, TimerMode::Relative)
            .unwrap();
    });
    let _ = rig.core.deregister_clock(id);
}

#[test]
fn global_extension_timers_live_on_cpu0() {
    let rig = rig(2);
    let dev = TestDevice::default();
    let id = rig
        .core
        .register_clock("global", Box::new(dev.clone()), None)
        .unwrap();
    rig.hw.set_current_cpu(1);
    let tid = rig.core.atomic(|nk| {
        let tid = nk.timer_init(id, "t", GravityTier::User, noop()).unwrap();
        nk.timer_migrate(tid, 1).unwrap();
        tid
    });
    rig.core.atomic(|nk| assert_eq!(nk.timer_cpu(tid).unwrap(), 0));
}

#[test]
fn restricted_extension_clock_ticks() {
    let rig = rig(2);
    let dev = TestDevice::default();
    let id = rig
        .core
        .register_clock("local", Box::new(dev.clone()), Some(CpuSet::single(1)))
        .unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let seen = hits.clone();
    let tid = rig.core.atomic(|nk| {
        let tid = nk
            .timer_init(
                id,
                "t",
                GravityTier::User,
                Box::new(move |_: &mut Locked<'_>, _: TimerId| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(nk.timer_cpu(tid).unwrap(), 1);
        // 5us at 1 MHz.
        nk.timer_start(tid, 5_000, None, TimerMode::Relative).unwrap();
        assert_eq!(nk.timer_raw_date(tid).unwrap(), 5);
        tid
    });
    assert_eq!(*dev.remote.lock().unwrap(), [1]);
    assert!(dev.local.lock().unwrap().is_empty());

    rig.hw.set_current_cpu(1);
    rig.core.atomic(|nk| nk.clock_tick(id)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(*dev.local.lock().unwrap(), [(1, 5)]);

    dev.set(5);
    rig.core.atomic(|nk| nk.clock_tick(id)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    rig.core.atomic(|nk| {
        assert!(!nk.timer_is_running(tid).unwrap());
        assert_eq!(nk.next_shot(id, 1).unwrap(), None);
    });
}

#[test]
fn wallclock_follows_updates() {
    let rig = rig(1);
    rig.advance_to(1_000);
    rig.core.atomic(|nk| {
        nk.set_wallclock(CORE, 5_000_000).unwrap();
        assert_eq!(nk.read_realtime(CORE).unwrap(), 5_000_000);
        assert_eq!(nk.wallclock_offset(CORE).unwrap(), 4_999_000);
    });
    rig.advance_to(3_000);
    rig.core.atomic(|nk| {
        assert_eq!(nk.read_monotonic(CORE).unwrap(), 3_000);
        assert_eq!(nk.read_realtime(CORE).unwrap(), 5_002_000);
        // The interrupt pipeline keeps the host wallclock to itself.
        assert_eq!(nk.propagate_wallclock(), Err(CoreError::NotSupported));
    });
}

#[test]
fn realtime_timers_shift_with_wallclock() {
    let rig = rig(1);
    rig.core.atomic(|nk| {
        let mono = nk.timer_init(CORE, "mono", GravityTier::User, noop()).unwrap();
        nk.timer_start(mono, 5_000_000, None, TimerMode::Absolute)
            .unwrap();
        let wall = nk.timer_init(CORE, "wall", GravityTier::User, noop()).unwrap();
        nk.timer_start(wall, 5_000_000, None, TimerMode::Realtime)
            .unwrap();
        assert!(nk.timer_status(wall).unwrap().realtime);

        nk.set_wallclock(CORE, 1_000_000).unwrap();
        assert_eq!(nk.timer_get_date(wall).unwrap(), Some(4_000_000));
        assert_eq!(nk.timer_get_date(mono).unwrap(), Some(5_000_000));
        assert_eq!(nk.next_shot(CORE, 0).unwrap(), Some(4_000_000));
    });
}

#[test]
fn forward_jump_skips_missed_periods() {
    let rig = rig(1);
    let tid = rig.core.atomic(|nk| {
        let tid = nk.timer_init(CORE, "wall", GravityTier::User, noop()).unwrap();
        nk.timer_start(tid, 10_000, Some(1_000), TimerMode::Realtime)
            .unwrap();
        tid
    });
    rig.advance_to(10_500);
    rig.core.atomic(|nk| {
        nk.set_wallclock(CORE, 15_500).unwrap();
        assert_eq!(nk.timer_periodic_ticks(tid).unwrap(), 5);
        assert_eq!(nk.timer_get_date(tid).unwrap(), Some(10_000));
    });
}

#[test]
fn backward_jump_pulls_fired_timer_back() {
    let rig = rig(1);
    let tid = rig.core.atomic(|nk| {
        nk.set_wallclock(CORE, 100_000).unwrap();
        let tid = nk.timer_init(CORE, "wall", GravityTier::User, noop()).unwrap();
        nk.timer_start(tid, 101_000, Some(1_000), TimerMode::Realtime)
            .unwrap();
        assert_eq!(nk.timer_get_date(tid).unwrap(), Some(1_000));
        tid
    });
    rig.advance_to(1_000);
    rig.tick(0);
    rig.core.atomic(|nk| {
        assert_eq!(nk.timer_get_date(tid).unwrap(), Some(2_000));
        // Wallclock steps back 5us: the series restarts at 101us wall time.
        nk.set_wallclock(CORE, 96_000).unwrap();
        assert_eq!(nk.timer_periodic_ticks(tid).unwrap(), 0);
        assert_eq!(nk.timer_get_date(tid).unwrap(), Some(6_000));
    });
}

#[test]
fn offset_round_trip_keeps_served_period() {
    let rig = rig(1);
    let hits = Arc::new(AtomicU32::new(0));
    let seen = hits.clone();
    let tid = rig.core.atomic(|nk| {
        let tid = nk
            .timer_init(
                CORE,
                "wall",
                GravityTier::User,
                Box::new(move |_: &mut Locked<'_>, _: TimerId| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        nk.timer_start(tid, 10_000, Some(1_000), TimerMode::Realtime)
            .unwrap();
        tid
    });
    rig.advance_to(10_000);
    rig.tick(0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    rig.core.atomic(|nk| {
        assert_eq!(nk.timer_raw_date(tid).unwrap(), 11_000);
        for delta in [1, 500, 1_000, 2_500] {
            nk.apply_offset(CORE, delta).unwrap();
            nk.apply_offset(CORE, -delta).unwrap();
            assert_eq!(nk.timer_raw_date(tid).unwrap(), 11_000, "delta {delta}");
            assert_eq!(nk.timer_periodic_ticks(tid).unwrap(), 1);
        }
        assert_eq!(nk.next_shot(CORE, 0).unwrap(), Some(11_000));
    });
    rig.tick(0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn backward_pull_never_lands_on_now() {
    let rig = rig(1);
    let tid = rig.core.atomic(|nk| {
        let tid = nk.timer_init(CORE, "wall", GravityTier::User, noop()).unwrap();
        nk.timer_start(tid, 10_000, Some(1_000), TimerMode::Realtime)
            .unwrap();
        tid
    });
    rig.advance_to(10_000);
    rig.tick(0);
    rig.core.atomic(|nk| {
        // Pushed two periods ahead, pulled back to one.
        nk.apply_offset(CORE, -1_000).unwrap();
        assert_eq!(nk.timer_raw_date(tid).unwrap(), 11_000);
        assert_eq!(nk.timer_periodic_ticks(tid).unwrap(), 0);
    });
}

#[test]
fn gravity_round_trips_in_ns() {
    let rig = rig(1);
    let id = rig
        .core
        .register_clock("ext", Box::new(TestDevice::default()), None)
        .unwrap();
    rig.core.atomic(|nk| {
        let gravity = Gravity {
            irq: 2_000,
            kernel: 3_000,
            user: 7_000,
        };
        nk.set_gravity(id, gravity).unwrap();
        assert_eq!(nk.gravity(id).unwrap(), gravity);
        nk.reset_gravity(id).unwrap();
        assert_eq!(nk.gravity(id).unwrap(), Gravity::default());
    });
}
