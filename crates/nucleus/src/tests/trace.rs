use nkpipe::ipipe::IpipeBackend;
use nkpipe::sim::{SimHardware, HW_TIMER_IRQ};
use nktrace::{records, MemoryBackend, TraceConfig, TraceRecord, Tracer};

use crate::clock::ClockId;
use crate::config::CoreConfig;
use crate::intr::{IntrFlags, IrqReturn};
use crate::kernel::{Locked, RealtimeCore};
use crate::thread::{RelaxReason, ThreadSpec};
use crate::timer::{GravityTier, TimerId, TimerMode};

fn payloads(records: &[TraceRecord], record_type: u8) -> Vec<Vec<u8>> {
    records
        .iter()
        .filter(|r| r.record_type == record_type)
        .map(|r| r.payload.clone())
        .collect()
}

fn bytes(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

#[test]
fn nucleus_events_reach_the_tracer() {
    let backend = MemoryBackend::new();
    let config = TraceConfig {
        include_timestamp: false,
        ..TraceConfig::default()
    };
    let handle = Tracer::new(config, backend.clone()).into_handle();
    let hw = SimHardware::new(1);
    let core = RealtimeCore::builder(IpipeBackend::new(hw.clone()))
        .config(CoreConfig::builder().watchdog_timeout(None).build())
        .trace_hook(handle.hook())
        .build()
        .unwrap();
    backend.clear();

    let tid = core.atomic(|nk| {
        let tid = nk
            .timer_init(
                ClockId::CORE,
                "traced",
                GravityTier::User,
                Box::new(|_: &mut Locked<'_>, _: TimerId| {}),
            )
            .unwrap();
        nk.timer_start(tid, 1_000, None, TimerMode::Relative).unwrap();
        tid
    });
    hw.set_now(hw.ns_to_cycles(1_000));
    core.handle_irq(HW_TIMER_IRQ);

    let intr = core
        .intr_init(
            "uart",
            40,
            Box::new(|_: &mut Locked<'_>, _: usize| IrqReturn::HANDLED),
            IntrFlags::empty(),
        )
        .unwrap();
    core.intr_attach(intr, 0, None).unwrap();
    core.handle_irq(40);

    let thread = core.register_thread(ThreadSpec::new("rt", 10)).unwrap();
    core.atomic(|nk| {
        nk.harden(thread).unwrap();
        nk.relax(thread, false, RelaxReason::Fault).unwrap();
    });

    let recs = backend.records();
    assert_eq!(recs.len(), backend.frames().len());
    let id = tid.0.to_le_bytes();
    let core_clock = (-1i32).to_le_bytes();
    let cpu0 = 0u16.to_le_bytes();
    let date = 1_000u64.to_le_bytes();

    // The thread's own timers follow.
    assert_eq!(
        payloads(&recs, records::timer::INIT)[0],
        bytes(&[&id[..], &core_clock[..], &cpu0[..]])
    );
    assert_eq!(
        payloads(&recs, records::timer::START),
        [bytes(&[&id[..], &date[..], &0u64.to_le_bytes()[..]])]
    );
    assert_eq!(
        payloads(&recs, records::clock::PROGRAM)[0],
        bytes(&[&core_clock[..], &cpu0[..], &id[..], &date[..]])
    );
    assert_eq!(
        payloads(&recs, records::clock::TICK),
        [bytes(&[&core_clock[..], &cpu0[..], &date[..]])]
    );
    assert_eq!(payloads(&recs, records::timer::EXPIRE), [bytes(&[&id[..], &date[..]])]);
    let line = 40u32.to_le_bytes();
    assert_eq!(
        payloads(&recs, records::irq::ATTACH),
        [bytes(&[&line[..], &intr.0.to_le_bytes()[..]])]
    );
    assert_eq!(payloads(&recs, records::irq::ENTRY), [line.to_vec()]);
    assert_eq!(payloads(&recs, records::irq::EXIT), [line.to_vec()]);

    let th = thread.0.to_le_bytes();
    let host = u32::MAX.to_le_bytes();
    assert_eq!(
        payloads(&recs, records::sched::SWITCH),
        [bytes(&[&cpu0[..], &host[..], &th[..]]), bytes(&[&cpu0[..], &th[..], &host[..]])]
    );
    assert_eq!(payloads(&recs, records::shadow::HARDENED), [bytes(&[&th[..], &cpu0[..]])]);
    assert_eq!(
        payloads(&recs, records::shadow::GORELAX),
        [bytes(&[&th[..], &3u16.to_le_bytes()[..]])]
    );

    // Sequence numbers follow emission order.
    let kinds: Vec<u8> = recs
        .iter()
        .map(|r| r.record_type)
        .filter(|t| (64..=67).contains(t))
        .collect();
    assert_eq!(
        kinds,
        [
            records::shadow::GOHARD,
            records::shadow::HARDENED,
            records::shadow::GORELAX,
            records::shadow::RELAXED,
        ]
    );
}
