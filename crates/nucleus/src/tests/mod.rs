use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nkpipe::ipipe::IpipeBackend;
use nkpipe::sim::{SimHardware, HW_TIMER_IRQ};

use crate::clock::ClockDevice;
use crate::config::CoreConfig;
use crate::kernel::RealtimeCore;

mod clock;
mod modeswitch;
mod thread;
#[cfg(feature = "trace")]
mod trace;

pub(crate) struct Rig {
    pub hw: Arc<SimHardware>,
    pub core: RealtimeCore<IpipeBackend>,
}

/// Simulated core without watchdog.
pub(crate) fn rig(nr_cpus: usize) -> Rig {
    rig_with(nr_cpus, CoreConfig::builder().watchdog_timeout(None).build())
}

pub(crate) fn rig_with(nr_cpus: usize, config: CoreConfig) -> Rig {
    let hw = SimHardware::new(nr_cpus);
    let core = RealtimeCore::builder(IpipeBackend::new(hw.clone()))
        .config(config)
        .build()
        .expect("nucleus up");
    hw.take_ipis();
    Rig { hw, core }
}

impl Rig {
    /// Hardware timer interrupt on `cpu`.
    pub fn tick(&self, cpu: usize) {
        self.hw.set_current_cpu(cpu);
        self.core.handle_irq(HW_TIMER_IRQ);
    }

    pub fn advance_to(&self, ns: u64) {
        self.hw.set_now(self.hw.ns_to_cycles(ns));
    }
}

/// Extension clock device driven by hand.
#[derive(Clone, Default)]
pub(crate) struct TestDevice {
    pub now: Arc<AtomicU64>,
    pub local: Arc<Mutex<Vec<(usize, u64)>>>,
    pub remote: Arc<Mutex<Vec<usize>>>,
}

impl TestDevice {
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::SeqCst);
    }
}

impl ClockDevice for TestDevice {
    fn name(&self) -> &str {
        "testdev"
    }

    fn read_raw(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        1_000_000
    }

    fn program_local_shot(&mut self, cpu: usize, delay: u64) {
        self.local.lock().unwrap().push((cpu, delay));
    }

    fn program_remote_shot(&mut self, cpu: usize) {
        self.remote.lock().unwrap().push(cpu);
    }
}
