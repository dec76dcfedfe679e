//! Interrupt staging backend.
//!
//! IPIs use fixed out-of-band vectors and the host tick device is replaced
//! by a per-CPU proxy while the real-time core owns the hardware timer. The
//! host wall clock can be written back.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::sim::{IpiKind, SimHardware, HW_TIMER_IRQ, NR_HW_IRQS};
use crate::{CpuSet, Pipeline, PipelineError, SirqHandler, SirqId};

/// Base of the out-of-band IPI vector range.
pub const OOB_IPI_BASE: u32 = 2048;
pub const TIMER_OOB_IPI: u32 = OOB_IPI_BASE;
pub const RESCHEDULE_OOB_IPI: u32 = OOB_IPI_BASE + 1;

#[derive(Default)]
struct OobVectors {
    timer: bool,
    resched: bool,
}

pub struct DovetailBackend {
    hw: Arc<SimHardware>,
    proxies: Mutex<CpuSet>,
    vectors: Mutex<OobVectors>,
}

impl DovetailBackend {
    pub fn new(hw: Arc<SimHardware>) -> Self {
        Self {
            hw,
            proxies: Mutex::new(CpuSet::empty()),
            vectors: Mutex::new(OobVectors::default()),
        }
    }

    pub fn hardware(&self) -> &Arc<SimHardware> {
        &self.hw
    }

    /// CPUs whose host tick device is currently proxied.
    pub fn proxied_cpus(&self) -> CpuSet {
        *self.proxies.lock()
    }
}

impl Pipeline for DovetailBackend {
    fn name(&self) -> &'static str {
        "dovetail"
    }

    fn enable_oob_stage(&self) -> Result<(), PipelineError> {
        if self.hw.set_oob_stage(true) {
            return Err(PipelineError::Busy);
        }
        Ok(())
    }

    fn disable_oob_stage(&self) {
        self.hw.set_oob_stage(false);
    }

    fn online_cpus(&self) -> CpuSet {
        self.hw.online_cpus()
    }

    fn current_cpu(&self) -> usize {
        self.hw.current_cpu()
    }

    fn nr_irqs(&self) -> u32 {
        NR_HW_IRQS
    }

    fn read_cycle_counter(&self) -> u64 {
        self.hw.now()
    }

    fn cycle_frequency(&self) -> u64 {
        self.hw.frequency()
    }

    fn read_wallclock(&self) -> u64 {
        self.hw.wallclock()
    }

    fn set_wallclock(&self, epoch_ns: u64) -> Result<(), PipelineError> {
        self.hw.set_wallclock(epoch_ns);
        Ok(())
    }

    fn request_timer(&self, cpu: usize) -> Result<(), PipelineError> {
        self.hw.grab_timer(cpu)?;
        self.proxies.lock().insert(cpu);
        Ok(())
    }

    fn free_timer(&self, cpu: usize) {
        self.proxies.lock().remove(cpu);
        self.hw.release_timer(cpu);
    }

    fn timer_irq(&self) -> u32 {
        HW_TIMER_IRQ
    }

    fn set_timer_shot(&self, delay: u64) {
        self.hw.program_shot(delay);
    }

    fn request_timer_ipi(&self) -> Result<u32, PipelineError> {
        let mut vectors = self.vectors.lock();
        if vectors.timer {
            return Err(PipelineError::Busy);
        }
        vectors.timer = true;
        Ok(TIMER_OOB_IPI)
    }

    fn free_timer_ipi(&self) {
        self.vectors.lock().timer = false;
    }

    fn send_timer_ipi(&self, cpus: CpuSet) {
        if self.vectors.lock().timer {
            self.hw.record_ipi(IpiKind::Timer, TIMER_OOB_IPI, cpus);
        }
    }

    fn request_resched_ipi(&self) -> Result<u32, PipelineError> {
        let mut vectors = self.vectors.lock();
        if vectors.resched {
            return Err(PipelineError::Busy);
        }
        vectors.resched = true;
        Ok(RESCHEDULE_OOB_IPI)
    }

    fn free_resched_ipi(&self) {
        self.vectors.lock().resched = false;
    }

    fn send_resched_ipi(&self, cpus: CpuSet) {
        if self.vectors.lock().resched {
            self.hw
                .record_ipi(IpiKind::Resched, RESCHEDULE_OOB_IPI, cpus);
        }
    }

    fn create_inband_sirq(&self, handler: SirqHandler) -> Result<SirqId, PipelineError> {
        Ok(self.hw.add_sirq(handler))
    }

    fn delete_inband_sirq(&self, sirq: SirqId) {
        self.hw.remove_sirq(sirq);
    }

    fn post_inband_sirq(&self, sirq: SirqId) {
        self.hw.raise_sirq(sirq);
    }

    fn attach_kevents(&self) -> Result<(), PipelineError> {
        if self.hw.set_kevents(true) {
            return Err(PipelineError::Busy);
        }
        Ok(())
    }

    fn detach_kevents(&self) {
        self.hw.set_kevents(false);
    }

    fn request_irq(&self, irq: u32, cpus: CpuSet) -> Result<(), PipelineError> {
        if irq >= NR_HW_IRQS {
            return Err(PipelineError::InvalidIrq(irq));
        }
        self.hw.request_line(irq, cpus, true)
    }

    fn free_irq(&self, irq: u32) {
        self.hw.free_line(irq);
    }

    fn set_irq_affinity(&self, irq: u32, cpus: Option<CpuSet>) -> Result<(), PipelineError> {
        let online = self.hw.online_cpus();
        if let Some(set) = cpus {
            if set.and(online).is_empty() {
                return Err(PipelineError::InvalidCpu(set.first().unwrap_or(0)));
            }
        }
        self.hw
            .update_line(irq, |line| line.affinity = cpus.map(|set| set.and(online)))
    }

    fn enable_irq(&self, irq: u32) {
        let _ = self.hw.update_line(irq, |line| line.enabled = true);
    }

    fn disable_irq(&self, irq: u32) {
        let _ = self.hw.update_line(irq, |line| {
            line.enabled = false;
            line.disabled += 1;
        });
    }

    fn end_irq(&self, irq: u32) {
        let _ = self.hw.update_line(irq, |line| line.ended += 1);
    }

    fn propagate_irq(&self, irq: u32) {
        let _ = self.hw.update_line(irq, |line| line.propagated += 1);
    }

    fn propagate_host_tick(&self, cpu: usize) {
        // Only proxied CPUs have a host tick to relay.
        if self.proxies.lock().contains(cpu) {
            self.hw.host_tick(cpu);
        }
    }

    fn leave_inband(&self) -> Result<(), PipelineError> {
        self.hw.migrate_oob()
    }

    fn leave_oob(&self) {
        self.hw.migrate_inband();
    }

    fn raise_mayday(&self, pid: u32) {
        self.hw.mayday(pid);
    }
}
