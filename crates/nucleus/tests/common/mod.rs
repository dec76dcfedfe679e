//! Shared rig for the integration tests: a simulated machine under the
//! ipipe backend with a nucleus on top.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nkpipe::ipipe::IpipeBackend;
use nkpipe::sim::{SimHardware, HW_TIMER_IRQ};
use nucleus::{ClockDevice, CoreConfig, RealtimeCore};

pub struct Machine {
    pub hw: Arc<SimHardware>,
    pub core: RealtimeCore<IpipeBackend>,
}

impl Machine {
    pub fn new(nr_cpus: usize) -> Self {
        Self::with_config(nr_cpus, CoreConfig::builder().watchdog_timeout(None).build())
    }

    pub fn with_config(nr_cpus: usize, config: CoreConfig) -> Self {
        let hw = SimHardware::new(nr_cpus);
        let core = RealtimeCore::builder(IpipeBackend::new(hw.clone()))
            .config(config)
            .build()
            .expect("nucleus up");
        hw.take_ipis();
        Self { hw, core }
    }

    /// Moves the simulated time to `ns` and takes a timer interrupt on `cpu`.
    pub fn tick_at(&self, cpu: usize, ns: u64) {
        self.hw.set_now(self.hw.ns_to_cycles(ns));
        self.hw.set_current_cpu(cpu);
        self.core.handle_irq(HW_TIMER_IRQ);
    }
}

/// Nanosecond-resolution extension clock whose time only moves when told.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    pub shots: Arc<Mutex<Vec<(usize, u64)>>>,
}

impl ManualClock {
    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }
}

impl ClockDevice for ManualClock {
    fn name(&self) -> &str {
        "manual"
    }

    fn read_raw(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }

    fn program_local_shot(&mut self, cpu: usize, delay: u64) {
        self.shots.lock().unwrap().push((cpu, delay));
    }

    fn program_remote_shot(&mut self, _cpu: usize) {}
}
