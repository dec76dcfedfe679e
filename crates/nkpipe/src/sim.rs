//! Simulated interrupt hardware.
//!
//! [`SimHardware`] models what both backends sit on: a cycle counter, one
//! one-shot timer per CPU, IRQ lines, IPIs and the in-band soft IRQ queue.
//! Time only moves when the owner calls [`SimHardware::advance`] and the
//! "current CPU" is whatever [`SimHardware::set_current_cpu`] last selected,
//! which makes the nucleus fully deterministic under test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{CpuSet, PipelineError, SirqHandler, SirqId};

/// Default cycle counter frequency: one cycle per nanosecond.
pub const DEFAULT_FREQUENCY: u64 = 1_000_000_000;
/// Number of addressable hardware IRQ lines.
pub const NR_HW_IRQS: u32 = 1024;
/// IRQ line the per-CPU hardware timer ticks on.
pub const HW_TIMER_IRQ: u32 = 30;

const NSEC_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    Timer,
    Resched,
}

/// One IPI as seen on the interconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiRecord {
    pub kind: IpiKind,
    pub irq: u32,
    pub from: usize,
    pub cpus: CpuSet,
}

/// Observable state of an IRQ line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrqLineState {
    pub requested: bool,
    pub oob: bool,
    pub enabled: bool,
    pub affinity: Option<CpuSet>,
    pub ended: u64,
    pub propagated: u64,
    pub disabled: u64,
}

#[derive(Default)]
struct SirqTable {
    next: u32,
    handlers: BTreeMap<u32, Arc<dyn Fn() + Send + Sync>>,
    pending: Vec<u32>,
}

pub struct SimHardware {
    nr_cpus: usize,
    frequency: u64,
    cycles: AtomicU64,
    epoch_ns: AtomicU64,
    current: AtomicUsize,
    oob_stage: AtomicBool,
    kevents: AtomicBool,
    fail_leave_inband: AtomicBool,
    oob_migrations: AtomicU64,
    inband_migrations: AtomicU64,
    shots: Mutex<Vec<Option<u64>>>,
    timers: Mutex<CpuSet>,
    ipis: Mutex<Vec<IpiRecord>>,
    irqs: Mutex<BTreeMap<u32, IrqLineState>>,
    sirqs: Mutex<SirqTable>,
    host_ticks: Mutex<Vec<u64>>,
    maydays: Mutex<Vec<u32>>,
}

impl SimHardware {
    pub fn new(nr_cpus: usize) -> Arc<Self> {
        Self::with_frequency(nr_cpus, DEFAULT_FREQUENCY)
    }

    pub fn with_frequency(nr_cpus: usize, frequency: u64) -> Arc<Self> {
        let nr_cpus = nr_cpus.clamp(1, CpuSet::MAX_CPUS);
        Arc::new(Self {
            nr_cpus,
            frequency: frequency.max(1),
            cycles: AtomicU64::new(0),
            epoch_ns: AtomicU64::new(0),
            current: AtomicUsize::new(0),
            oob_stage: AtomicBool::new(false),
            kevents: AtomicBool::new(false),
            fail_leave_inband: AtomicBool::new(false),
            oob_migrations: AtomicU64::new(0),
            inband_migrations: AtomicU64::new(0),
            shots: Mutex::new(vec![None; nr_cpus]),
            timers: Mutex::new(CpuSet::empty()),
            ipis: Mutex::new(Vec::new()),
            irqs: Mutex::new(BTreeMap::new()),
            sirqs: Mutex::new(SirqTable::default()),
            host_ticks: Mutex::new(vec![0; nr_cpus]),
            maydays: Mutex::new(Vec::new()),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn online_cpus(&self) -> CpuSet {
        CpuSet::first_n(self.nr_cpus)
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    // --- time -----------------------------------------------------------

    pub fn now(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn advance(&self, cycles: u64) -> u64 {
        self.cycles.fetch_add(cycles, Ordering::SeqCst) + cycles
    }

    /// Advances the counter by `ns` nanoseconds worth of cycles.
    pub fn advance_ns(&self, ns: u64) -> u64 {
        self.advance(self.ns_to_cycles(ns))
    }

    /// Moves the counter to an absolute value. The counter never goes back.
    pub fn set_now(&self, cycles: u64) {
        self.cycles.fetch_max(cycles, Ordering::SeqCst);
    }

    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        (ns as u128 * self.frequency as u128 / NSEC_PER_SEC) as u64
    }

    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        (cycles as u128 * NSEC_PER_SEC / self.frequency as u128) as u64
    }

    /// Host wall clock in nanoseconds since the epoch.
    pub fn wallclock(&self) -> u64 {
        self.epoch_ns
            .load(Ordering::SeqCst)
            .saturating_add(self.cycles_to_ns(self.now()))
    }

    pub fn set_wallclock(&self, epoch_ns: u64) {
        let elapsed = self.cycles_to_ns(self.now());
        self.epoch_ns
            .store(epoch_ns.saturating_sub(elapsed), Ordering::SeqCst);
    }

    // --- CPUs -----------------------------------------------------------

    pub fn current_cpu(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        self.current.store(cpu.min(self.nr_cpus - 1), Ordering::SeqCst);
    }

    // --- per-CPU timer --------------------------------------------------

    pub(crate) fn grab_timer(&self, cpu: usize) -> Result<(), PipelineError> {
        if cpu >= self.nr_cpus {
            return Err(PipelineError::InvalidCpu(cpu));
        }
        let mut timers = self.timers.lock();
        if timers.contains(cpu) {
            return Err(PipelineError::Busy);
        }
        timers.insert(cpu);
        Ok(())
    }

    pub(crate) fn release_timer(&self, cpu: usize) {
        self.timers.lock().remove(cpu);
        if let Some(shot) = self.shots.lock().get_mut(cpu) {
            *shot = None;
        }
    }

    pub fn timer_grabbed(&self, cpu: usize) -> bool {
        self.timers.lock().contains(cpu)
    }

    pub(crate) fn program_shot(&self, delay: u64) {
        let cpu = self.current_cpu();
        let date = self.now().saturating_add(delay);
        if let Some(shot) = self.shots.lock().get_mut(cpu) {
            *shot = Some(date);
        }
    }

    /// Absolute cycle date last programmed on `cpu`'s timer.
    pub fn shot(&self, cpu: usize) -> Option<u64> {
        self.shots.lock().get(cpu).copied().flatten()
    }

    /// CPUs whose programmed shot is due at the current date.
    pub fn due_cpus(&self) -> CpuSet {
        let now = self.now();
        self.shots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, shot)| matches!(shot, Some(date) if *date <= now))
            .map(|(cpu, _)| cpu)
            .collect()
    }

    // --- IPIs -----------------------------------------------------------

    pub(crate) fn record_ipi(&self, kind: IpiKind, irq: u32, cpus: CpuSet) {
        let cpus = cpus.and(self.online_cpus());
        if cpus.is_empty() {
            return;
        }
        self.ipis.lock().push(IpiRecord {
            kind,
            irq,
            from: self.current_cpu(),
            cpus,
        });
    }

    pub fn ipis(&self) -> Vec<IpiRecord> {
        self.ipis.lock().clone()
    }

    pub fn take_ipis(&self) -> Vec<IpiRecord> {
        std::mem::take(&mut *self.ipis.lock())
    }

    // --- IRQ lines ------------------------------------------------------

    pub(crate) fn request_line(
        &self,
        irq: u32,
        cpus: CpuSet,
        oob: bool,
    ) -> Result<(), PipelineError> {
        let mut irqs = self.irqs.lock();
        let line = irqs.entry(irq).or_default();
        if line.requested {
            return Err(PipelineError::Busy);
        }
        *line = IrqLineState {
            requested: true,
            oob,
            enabled: true,
            affinity: Some(cpus),
            ..IrqLineState::default()
        };
        Ok(())
    }

    pub(crate) fn free_line(&self, irq: u32) {
        if let Some(line) = self.irqs.lock().get_mut(&irq) {
            line.requested = false;
            line.oob = false;
            line.enabled = false;
            line.affinity = None;
        }
    }

    pub(crate) fn update_line<F: FnOnce(&mut IrqLineState)>(
        &self,
        irq: u32,
        f: F,
    ) -> Result<(), PipelineError> {
        match self.irqs.lock().get_mut(&irq) {
            Some(line) if line.requested => {
                f(line);
                Ok(())
            }
            _ => Err(PipelineError::InvalidIrq(irq)),
        }
    }

    pub fn irq_line(&self, irq: u32) -> Option<IrqLineState> {
        self.irqs.lock().get(&irq).cloned()
    }

    // --- in-band work ---------------------------------------------------

    pub(crate) fn add_sirq(&self, handler: SirqHandler) -> SirqId {
        let mut table = self.sirqs.lock();
        let id = table.next;
        table.next += 1;
        table.handlers.insert(id, Arc::from(handler));
        SirqId(id)
    }

    pub(crate) fn remove_sirq(&self, sirq: SirqId) {
        let mut table = self.sirqs.lock();
        table.handlers.remove(&sirq.0);
        table.pending.retain(|id| *id != sirq.0);
    }

    pub(crate) fn raise_sirq(&self, sirq: SirqId) {
        let mut table = self.sirqs.lock();
        if table.handlers.contains_key(&sirq.0) && !table.pending.contains(&sirq.0) {
            table.pending.push(sirq.0);
        }
    }

    pub fn pending_sirqs(&self) -> usize {
        self.sirqs.lock().pending.len()
    }

    /// Lets the in-band stage run: executes every posted soft IRQ once and
    /// returns how many ran.
    pub fn run_inband(&self) -> usize {
        let handlers: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let mut table = self.sirqs.lock();
            let pending = std::mem::take(&mut table.pending);
            pending
                .iter()
                .filter_map(|id| table.handlers.get(id).cloned())
                .collect()
        };
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }

    // --- host side ------------------------------------------------------

    pub(crate) fn host_tick(&self, cpu: usize) {
        if let Some(count) = self.host_ticks.lock().get_mut(cpu) {
            *count += 1;
        }
    }

    pub fn host_ticks(&self, cpu: usize) -> u64 {
        self.host_ticks.lock().get(cpu).copied().unwrap_or(0)
    }

    pub(crate) fn mayday(&self, pid: u32) {
        self.maydays.lock().push(pid);
    }

    pub fn take_maydays(&self) -> Vec<u32> {
        std::mem::take(&mut *self.maydays.lock())
    }

    pub(crate) fn set_oob_stage(&self, on: bool) -> bool {
        self.oob_stage.swap(on, Ordering::SeqCst)
    }

    pub fn oob_stage_enabled(&self) -> bool {
        self.oob_stage.load(Ordering::SeqCst)
    }

    pub(crate) fn set_kevents(&self, on: bool) -> bool {
        self.kevents.swap(on, Ordering::SeqCst)
    }

    pub fn kevents_attached(&self) -> bool {
        self.kevents.load(Ordering::SeqCst)
    }

    /// Makes the next out-of-band migration fail as if a signal had arrived
    /// while switching stages.
    pub fn fail_next_leave_inband(&self) {
        self.fail_leave_inband.store(true, Ordering::SeqCst);
    }

    pub(crate) fn migrate_oob(&self) -> Result<(), PipelineError> {
        if self.fail_leave_inband.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::Interrupted);
        }
        self.oob_migrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn migrate_inband(&self) {
        self.inband_migrations.fetch_add(1, Ordering::SeqCst);
    }

    /// `(to out-of-band, to in-band)` stage migrations seen so far.
    pub fn migrations(&self) -> (u64, u64) {
        (
            self.oob_migrations.load(Ordering::SeqCst),
            self.inband_migrations.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn clock_and_shots() {
        let hw = SimHardware::with_frequency(2, 500_000_000);
        assert_eq!(hw.advance_ns(1_000), 500);
        hw.set_current_cpu(1);
        hw.program_shot(250);
        assert_eq!(hw.shot(1), Some(750));
        assert_eq!(hw.shot(0), None);
        hw.advance(250);
        assert_eq!(hw.due_cpus(), CpuSet::single(1));
    }

    #[test]
    fn wallclock_tracks_counter() {
        let hw = SimHardware::new(1);
        hw.set_wallclock(5_000);
        hw.advance(1_000);
        assert_eq!(hw.wallclock(), 6_000);
    }

    #[test]
    fn sirqs_run_once_per_post() {
        let hw = SimHardware::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = hw.add_sirq(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        hw.raise_sirq(id);
        hw.raise_sirq(id);
        assert_eq!(hw.run_inband(), 1);
        assert_eq!(hw.run_inband(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn injected_migration_failure_is_one_shot() {
        let hw = SimHardware::new(1);
        hw.fail_next_leave_inband();
        assert_eq!(hw.migrate_oob(), Err(PipelineError::Interrupted));
        assert_eq!(hw.migrate_oob(), Ok(()));
        assert_eq!(hw.migrations(), (1, 0));
    }
}
