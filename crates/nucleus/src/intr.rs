//! Interrupt objects and the out-of-band dispatch path.
//!
//! An interrupt object binds a service routine to an IRQ line. Several
//! objects may share a line when they all agree on it; the first attach
//! requests the line from the pipeline with out-of-band delivery and the
//! last detach frees it.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;
use nkpipe::{CpuSet, Pipeline};

use crate::clock::ClockId;
use crate::error::{CoreError, Result};
use crate::kernel::{Locked, RealtimeCore};
use crate::trace::{emit, records};
use crate::{make_name, Name};

bitflags! {
    /// Status returned by a service routine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqReturn: u32 {
        const NONE = 0x1;
        const HANDLED = 0x2;
        /// Hand the interrupt to the host kernel.
        const PROPAGATE = 0x100;
        /// Leave the line disabled.
        const DISABLE = 0x200;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntrFlags: u32 {
        const SHARED = 0x1;
        /// Edge-triggered shared line.
        const EDGE = 0x2;
    }
}

/// Interrupt service routine, called with the attach cookie.
pub type Isr = Box<dyn FnMut(&mut Locked<'_>, usize) -> IrqReturn + Send>;

/// Max handlers chained on one line.
pub const MAX_SHARED: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntrId(pub u32);

/// Per-CPU statistics of an interrupt object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqStat {
    pub hits: u64,
    /// Cycles spent in the service routine.
    pub exec_ticks: u64,
}

pub(crate) struct Intr {
    pub(crate) name: Name,
    pub(crate) irq: u32,
    pub(crate) isr: Option<Isr>,
    pub(crate) flags: IntrFlags,
    pub(crate) cookie: usize,
    pub(crate) attached: bool,
    pub(crate) stats: Vec<IrqStat>,
}

pub(crate) struct IrqLine {
    pub(crate) handlers: heapless::Vec<IntrId, MAX_SHARED>,
    pub(crate) flags: IntrFlags,
    pub(crate) affinity: CpuSet,
    /// Consecutive interrupts nobody claimed.
    pub(crate) unhandled: u32,
    pub(crate) disabled: bool,
}

impl<P: Pipeline> RealtimeCore<P> {
    /// Creates a detached interrupt object for `irq`.
    pub fn intr_init(&self, name: &str, irq: u32, isr: Isr, flags: IntrFlags) -> Result<IntrId> {
        if irq >= self.pipeline.nr_irqs() {
            return Err(CoreError::InvalidArgument("irq"));
        }
        let nr_slots = self.state.lock().nr_slots();
        let mut stats = Vec::new();
        stats
            .try_reserve_exact(nr_slots)
            .map_err(|_| CoreError::OutOfMemory)?;
        stats.resize(nr_slots, IrqStat::default());

        let mut st = self.state.lock();
        let id = IntrId(st.next_intr);
        st.next_intr += 1;
        st.intrs.insert(
            id,
            Intr {
                name: make_name(name),
                irq,
                isr: Some(isr),
                flags,
                cookie: 0,
                attached: false,
                stats,
            },
        );
        Ok(id)
    }

    /// Attaches `id` to its line, restricted to the real-time CPUs in
    /// `cpus` (`None` for all of them).
    pub fn intr_attach(&self, id: IntrId, cookie: usize, cpus: Option<CpuSet>) -> Result<()> {
        let mut st = self.state.lock();
        let rt_cpus = st.rt_cpus;
        let intr = st.intrs.get(&id).ok_or(CoreError::NotFound)?;
        if intr.attached {
            return Err(CoreError::Busy);
        }
        let affinity = cpus.unwrap_or(rt_cpus).and(rt_cpus);
        if affinity.is_empty() {
            return Err(CoreError::InvalidArgument("affinity"));
        }
        let (irq, flags) = (intr.irq, intr.flags);

        match st.lines.get_mut(&irq) {
            Some(line) => {
                let shareable = line.flags.contains(IntrFlags::SHARED)
                    && flags.contains(IntrFlags::SHARED)
                    && line.flags == flags;
                if !shareable {
                    return Err(CoreError::Busy);
                }
                line.handlers.push(id).map_err(|_| CoreError::Busy)?;
                let merged = line.affinity.or(affinity);
                line.affinity = merged;
                self.pipeline.set_irq_affinity(irq, Some(merged))?;
            }
            None => {
                self.pipeline.request_irq(irq, affinity)?;
                if let Err(err) = self.pipeline.set_irq_affinity(irq, Some(affinity)) {
                    self.pipeline.free_irq(irq);
                    return Err(err.into());
                }
                let mut handlers = heapless::Vec::new();
                // Capacity is at least one.
                let _ = handlers.push(id);
                st.lines.insert(
                    irq,
                    IrqLine {
                        handlers,
                        flags,
                        affinity,
                        unhandled: 0,
                        disabled: false,
                    },
                );
            }
        }

        if let Some(intr) = st.intrs.get_mut(&id) {
            intr.cookie = cookie;
            intr.attached = true;
            log::debug!("{} attached to IRQ {irq}", intr.name);
        }
        drop(st);
        emit(self.trace.as_ref(), records::irq::ATTACH, false, |p| {
            p.u32(irq).u32(id.0);
        });
        Ok(())
    }

    /// Detaches `id`. The line is released with its last handler.
    pub fn intr_detach(&self, id: IntrId) -> Result<()> {
        let mut st = self.state.lock();
        let intr = st.intrs.get_mut(&id).ok_or(CoreError::NotFound)?;
        if !intr.attached {
            return Ok(());
        }
        intr.attached = false;
        let irq = intr.irq;

        let empty = match st.lines.get_mut(&irq) {
            Some(line) => {
                line.handlers.retain(|h| *h != id);
                line.handlers.is_empty()
            }
            None => false,
        };
        if empty {
            st.lines.remove(&irq);
            self.pipeline.set_irq_affinity(irq, None).ok();
            self.pipeline.free_irq(irq);
        }
        drop(st);
        emit(self.trace.as_ref(), records::irq::DETACH, false, |p| {
            p.u32(irq).u32(id.0);
        });
        Ok(())
    }

    pub fn intr_destroy(&self, id: IntrId) -> Result<()> {
        self.intr_detach(id)?;
        self.state.lock().intrs.remove(&id);
        Ok(())
    }

    pub fn intr_enable(&self, id: IntrId) -> Result<()> {
        let mut st = self.state.lock();
        let irq = st.intrs.get(&id).ok_or(CoreError::NotFound)?.irq;
        if let Some(line) = st.lines.get_mut(&irq) {
            line.disabled = false;
            line.unhandled = 0;
        }
        self.pipeline.enable_irq(irq);
        Ok(())
    }

    pub fn intr_disable(&self, id: IntrId) -> Result<()> {
        let mut st = self.state.lock();
        let irq = st.intrs.get(&id).ok_or(CoreError::NotFound)?.irq;
        if let Some(line) = st.lines.get_mut(&irq) {
            line.disabled = true;
        }
        self.pipeline.disable_irq(irq);
        Ok(())
    }

    pub fn intr_stat(&self, id: IntrId, cpu: usize) -> Result<IrqStat> {
        let st = self.state.lock();
        let intr = st.intrs.get(&id).ok_or(CoreError::NotFound)?;
        intr.stats
            .get(cpu)
            .copied()
            .ok_or(CoreError::InvalidArgument("cpu"))
    }

    /// Whether the line of `id` was left disabled.
    pub fn intr_line_disabled(&self, id: IntrId) -> Result<bool> {
        let st = self.state.lock();
        let irq = st.intrs.get(&id).ok_or(CoreError::NotFound)?.irq;
        Ok(st.lines.get(&irq).is_some_and(|line| line.disabled))
    }
}

impl Locked<'_> {
    pub(crate) fn irq_enter(&mut self, cpu: usize) {
        if let Some(sched) = self.st.scheds.get_mut(cpu) {
            sched.inesting += 1;
        }
    }

    /// Interrupt epilogue. Leaving the outermost level relays a pending
    /// host tick when the host runs, then reschedules.
    pub(crate) fn irq_exit(&mut self, cpu: usize) {
        let Some(sched) = self.st.scheds.get_mut(cpu) else {
            return;
        };
        sched.inesting = sched.inesting.saturating_sub(1);
        if sched.inesting > 0 {
            return;
        }
        if sched.curr.is_none() && sched.htick {
            self.host_tick(cpu);
        }
        self.sched_run();
    }

    /// Runs the routine of `id`. Returns `None` when the object vanished.
    fn run_isr(&mut self, id: IntrId, cpu: usize) -> Option<IrqReturn> {
        let intr = self.st.intrs.get_mut(&id)?;
        let cookie = intr.cookie;
        let mut isr = intr.isr.take()?;
        let start = self.pipe.read_cycle_counter();
        let ret = isr(self, cookie);
        let elapsed = self.pipe.read_cycle_counter().saturating_sub(start);
        debug_assert!(
            ret.intersects(IrqReturn::HANDLED | IrqReturn::NONE),
            "service routine returned neither HANDLED nor NONE"
        );

        let intr = self.st.intrs.get_mut(&id)?;
        if intr.isr.is_none() {
            intr.isr = Some(isr);
        }
        if ret.contains(IrqReturn::HANDLED) {
            if let Some(stat) = intr.stats.get_mut(cpu) {
                stat.hits += 1;
                stat.exec_ticks += elapsed;
            }
        }
        Some(ret)
    }

    /// Out-of-band dispatch of a device interrupt.
    pub fn dispatch_irq(&mut self, irq: u32) {
        let cpu = self.pipe.current_cpu();
        self.irq_enter(cpu);
        emit(self.trace, records::irq::ENTRY, true, |p| {
            p.u32(irq);
        });

        let Some(line) = self.st.lines.get(&irq) else {
            // Not ours.
            self.pipe.propagate_irq(irq);
            self.irq_exit(cpu);
            return;
        };
        let handlers = line.handlers.clone();
        let edge = line.flags.contains(IntrFlags::SHARED | IntrFlags::EDGE);

        let mut ret = IrqReturn::empty();
        if edge {
            // Re-run the chain until a full pass finds nothing left to do.
            for _ in 0..self.cfg.max_edge_irq_passes.max(1) {
                let mut pass = IrqReturn::empty();
                for &id in handlers.iter() {
                    pass |= self.run_isr(id, cpu).unwrap_or(IrqReturn::NONE);
                }
                ret |= pass;
                if !pass.contains(IrqReturn::HANDLED) {
                    break;
                }
            }
        } else {
            for &id in handlers.iter() {
                ret |= self.run_isr(id, cpu).unwrap_or(IrqReturn::NONE);
            }
        }

        let max_unhandled = self.cfg.max_unhandled_irqs;
        if let Some(line) = self.st.lines.get_mut(&irq) {
            if ret.contains(IrqReturn::HANDLED) {
                line.unhandled = 0;
            } else {
                line.unhandled += 1;
                if line.unhandled >= max_unhandled {
                    ret |= IrqReturn::DISABLE;
                }
            }
            if !ret.contains(IrqReturn::PROPAGATE) && ret.contains(IrqReturn::DISABLE) {
                line.disabled = true;
            }
        }

        if ret.contains(IrqReturn::PROPAGATE) {
            self.pipe.propagate_irq(irq);
        } else if ret.contains(IrqReturn::DISABLE) {
            self.pipe.disable_irq(irq);
            emit(self.trace, records::irq::DISABLE, false, |p| {
                p.u32(irq);
            });
        } else {
            self.pipe.end_irq(irq);
        }

        emit(self.trace, records::irq::EXIT, true, |p| {
            p.u32(irq);
        });
        self.irq_exit(cpu);
    }

    /// Hardware timer interrupt of the calling CPU.
    pub fn handle_core_tick(&mut self) {
        let cpu = self.pipe.current_cpu();
        if !self.st.rt_cpus.contains(cpu) {
            self.pipe.propagate_host_tick(cpu);
            return;
        }
        self.irq_enter(cpu);
        let start = self.pipe.read_cycle_counter();
        // The core clock cannot go away and `cpu` has a slot.
        let _ = self.clock_tick(ClockId::CORE);
        let elapsed = self.pipe.read_cycle_counter().saturating_sub(start);
        if let Some(sched) = self.st.scheds.get_mut(cpu) {
            sched.timer_stat.hits += 1;
            sched.timer_stat.exec_ticks += elapsed;
        }
        self.irq_exit(cpu);
    }

    /// Timer IPI: another CPU queued a timer heading this CPU's queue.
    pub fn handle_timer_ipi(&mut self) {
        self.handle_core_tick();
    }

    /// Reschedule IPI.
    pub fn handle_resched_ipi(&mut self) {
        let cpu = self.pipe.current_cpu();
        self.irq_enter(cpu);
        if let Some(sched) = self.st.scheds.get_mut(cpu) {
            sched.resched = true;
        }
        self.irq_exit(cpu);
    }
}
