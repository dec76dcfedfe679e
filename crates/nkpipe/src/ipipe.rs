//! Interrupt virtualization backend.
//!
//! This layer has no dedicated out-of-band IPI vectors: IPIs are carried
//! over virtual IRQs allocated on demand above the hardware range. It cannot
//! write the host wall clock back.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::sim::{IpiKind, SimHardware, HW_TIMER_IRQ, NR_HW_IRQS};
use crate::{CpuSet, Pipeline, PipelineError, SirqHandler, SirqId};

/// First virtual IRQ number.
pub const VIRQ_BASE: u32 = NR_HW_IRQS;
/// Number of virtual IRQs available for IPIs.
pub const NR_VIRQS: u32 = 32;

#[derive(Default)]
struct VirqMap {
    used: u32,
    timer_ipi: Option<u32>,
    resched_ipi: Option<u32>,
}

impl VirqMap {
    fn alloc(&mut self) -> Result<u32, PipelineError> {
        let slot = (0..NR_VIRQS)
            .find(|&n| self.used & (1 << n) == 0)
            .ok_or(PipelineError::NoResource)?;
        self.used |= 1 << slot;
        Ok(VIRQ_BASE + slot)
    }

    fn free(&mut self, virq: u32) {
        if let Some(slot) = virq.checked_sub(VIRQ_BASE) {
            if slot < NR_VIRQS {
                self.used &= !(1 << slot);
            }
        }
    }
}

pub struct IpipeBackend {
    hw: Arc<SimHardware>,
    virqs: Mutex<VirqMap>,
}

impl IpipeBackend {
    pub fn new(hw: Arc<SimHardware>) -> Self {
        Self {
            hw,
            virqs: Mutex::new(VirqMap::default()),
        }
    }

    pub fn hardware(&self) -> &Arc<SimHardware> {
        &self.hw
    }

    fn ipi(&self, kind: IpiKind, virq: Option<u32>, cpus: CpuSet) {
        if let Some(virq) = virq {
            self.hw.record_ipi(kind, virq, cpus);
        }
    }
}

impl Pipeline for IpipeBackend {
    fn name(&self) -> &'static str {
        "ipipe"
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

    fn set_wallclock(&self, _epoch_ns: u64) -> Result<(), PipelineError> {
        Err(PipelineError::NotSupported(self.name()))
    }

    fn request_timer(&self, cpu: usize) -> Result<(), PipelineError> {
        self.hw.grab_timer(cpu)
    }

    fn free_timer(&self, cpu: usize) {
        self.hw.release_timer(cpu);
    }

    fn timer_irq(&self) -> u32 {
        HW_TIMER_IRQ
    }

    fn set_timer_shot(&self, delay: u64) {
        self.hw.program_shot(delay);
    }

    fn request_timer_ipi(&self) -> Result<u32, PipelineError> {
        let mut virqs = self.virqs.lock();
        if virqs.timer_ipi.is_some() {
            return Err(PipelineError::Busy);
        }
        let virq = virqs.alloc()?;
        virqs.timer_ipi = Some(virq);
        Ok(virq)
    }

    fn free_timer_ipi(&self) {
        let mut virqs = self.virqs.lock();
        if let Some(virq) = virqs.timer_ipi.take() {
            virqs.free(virq);
        }
    }

    fn send_timer_ipi(&self, cpus: CpuSet) {
        let virq = self.virqs.lock().timer_ipi;
        self.ipi(IpiKind::Timer, virq, cpus);
    }

    fn request_resched_ipi(&self) -> Result<u32, PipelineError> {
        let mut virqs = self.virqs.lock();
        if virqs.resched_ipi.is_some() {
            return Err(PipelineError::Busy);
        }
        let virq = virqs.alloc()?;
        virqs.resched_ipi = Some(virq);
        Ok(virq)
    }

    fn free_resched_ipi(&self) {
        let mut virqs = self.virqs.lock();
        if let Some(virq) = virqs.resched_ipi.take() {
            virqs.free(virq);
        }
    }

    fn send_resched_ipi(&self, cpus: CpuSet) {
        let virq = self.virqs.lock().resched_ipi;
        self.ipi(IpiKind::Resched, virq, cpus);
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
        // The host tick is the hardware timer IRQ posted to the root domain.
        self.hw.host_tick(cpu);
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
