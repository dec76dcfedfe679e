//! Per-CPU scheduler slots.
//!
//! Each CPU slot tracks the thread it runs out-of-band (`None` is the host
//! kernel, the "root" context), pending rescheduling requests, the host
//! tick relay timer and the runaway thread watchdog.

use alloc::collections::BTreeMap;
use core::cmp::Reverse;

use nkpipe::CpuSet;

use crate::arch::{self, ArchContext};
use crate::error::{CoreError, Result};
use crate::intr::IrqStat;
use crate::kernel::Locked;
use crate::thread::{RelaxReason, SigSet, Thread, ThreadId};
use crate::timer::{TimerId, TimerMode};
use crate::trace::{emit, records};

pub(crate) struct Sched {
    pub(crate) cpu: usize,
    pub(crate) curr: Option<ThreadId>,
    pub(crate) resched: bool,
    /// Remote CPUs to kick on the next scheduling pass.
    pub(crate) resched_remote: CpuSet,
    pub(crate) in_tick: bool,
    pub(crate) inesting: u32,
    /// Host tick pending relay.
    pub(crate) htick: bool,
    /// Host tick postponed behind real-time work.
    pub(crate) hdefer: bool,
    pub(crate) idle: bool,
    pub(crate) htimer: Option<TimerId>,
    pub(crate) wdtimer: Option<TimerId>,
    pub(crate) wdcount: u32,
    /// Exited thread still referenced as `curr`.
    pub(crate) zombie: Option<ThreadId>,
    pub(crate) root_ctx: ArchContext,
    pub(crate) live: ArchContext,
    pub(crate) timer_stat: IrqStat,
}

impl Sched {
    pub(crate) fn new(cpu: usize) -> Self {
        Self {
            cpu,
            curr: None,
            resched: false,
            resched_remote: CpuSet::empty(),
            in_tick: false,
            inesting: 0,
            htick: false,
            hdefer: false,
            idle: true,
            htimer: None,
            wdtimer: None,
            wdcount: 0,
            zombie: None,
            root_ctx: ArchContext::default(),
            live: ArchContext::default(),
            timer_stat: IrqStat::default(),
        }
    }
}

/// Snapshot of a CPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedView {
    pub cpu: usize,
    pub curr: Option<ThreadId>,
    pub resched: bool,
    pub inesting: u32,
    pub htick: bool,
    pub hdefer: bool,
    pub idle: bool,
    pub wdcount: u32,
    pub timer_stat: IrqStat,
    pub host_timer: Option<TimerId>,
    pub watchdog_timer: Option<TimerId>,
}

/// Highest priority ready thread of `cpu`; the current one wins ties.
fn pick_next(
    threads: &BTreeMap<ThreadId, Thread>,
    cpu: usize,
    curr: Option<ThreadId>,
) -> Option<ThreadId> {
    threads
        .iter()
        .filter(|(_, t)| t.cpu == cpu && t.is_ready())
        .max_by_key(|(id, t)| (t.priority, Some(**id) == curr, Reverse(**id)))
        .map(|(id, _)| *id)
}

impl Locked<'_> {
    pub fn sched_view(&self, cpu: usize) -> Result<SchedView> {
        let sched = self
            .st
            .scheds
            .get(cpu)
            .ok_or(CoreError::InvalidArgument("cpu"))?;
        Ok(SchedView {
            cpu: sched.cpu,
            curr: sched.curr,
            resched: sched.resched,
            inesting: sched.inesting,
            htick: sched.htick,
            hdefer: sched.hdefer,
            idle: sched.idle,
            wdcount: sched.wdcount,
            timer_stat: sched.timer_stat,
            host_timer: sched.htimer,
            watchdog_timer: sched.wdtimer,
        })
    }

    /// Thread running out-of-band on `cpu`, `None` for the host kernel.
    pub fn current_thread(&self, cpu: usize) -> Option<ThreadId> {
        self.st.scheds.get(cpu).and_then(|s| s.curr)
    }

    /// Marks `cpu` for rescheduling. A remote CPU gets an IPI at the next
    /// scheduling pass of the calling CPU.
    pub fn set_resched(&mut self, cpu: usize) {
        let current = self.pipe.current_cpu();
        let scheds = &mut self.st.scheds;
        let Some(target) = scheds.get_mut(cpu) else {
            return;
        };
        target.resched = true;
        if cpu != current {
            if let Some(local) = scheds.get_mut(current) {
                local.resched_remote.insert(cpu);
                local.resched = true;
            }
        }
    }

    /// Scheduling pass on the calling CPU. Deferred while inside an
    /// interrupt; returns whether a context switch happened.
    pub fn sched_run(&mut self) -> bool {
        let cpu = self.pipe.current_cpu();
        let st = &mut *self.st;
        let Some(sched) = st.scheds.get_mut(cpu) else {
            return false;
        };
        if sched.inesting > 0 || !sched.resched {
            return false;
        }
        sched.resched = false;

        let remote = core::mem::replace(&mut sched.resched_remote, CpuSet::empty());
        if !remote.is_empty() {
            self.pipe.send_resched_ipi(remote);
            emit(self.trace, records::sched::REMOTE, false, |p| {
                p.u64(remote.bits());
            });
        }

        let prev = sched.curr;
        let next = pick_next(&st.threads, cpu, prev);
        if next == prev {
            return false;
        }

        let to = match next.and_then(|tid| st.threads.get(&tid)) {
            Some(thread) => thread.ctx,
            None => sched.root_ctx,
        };
        match prev.and_then(|tid| st.threads.get_mut(&tid)) {
            Some(thread) => arch::switch_to(&mut sched.live, &mut thread.ctx, &to),
            None => arch::switch_to(&mut sched.live, &mut sched.root_ctx, &to),
        }
        if let Some(thread) = next.and_then(|tid| st.threads.get_mut(&tid)) {
            thread.stats.csw += 1;
        }
        sched.curr = next;
        sched.wdcount = 0;

        if let Some(zombie) = sched.zombie.filter(|z| Some(*z) != next) {
            sched.zombie = None;
            st.threads.remove(&zombie);
        }
        let relay = next.is_none() && sched.htick;

        emit(self.trace, records::sched::SWITCH, true, |p| {
            p.u16(cpu as u16)
                .u32(prev.map_or(u32::MAX, |t| t.0))
                .u32(next.map_or(u32::MAX, |t| t.0));
        });
        if relay {
            self.host_tick(cpu);
        }
        true
    }

    /// Hands the pending host tick of `cpu` to the host kernel.
    pub(crate) fn host_tick(&mut self, cpu: usize) {
        if let Some(sched) = self.st.scheds.get_mut(cpu) {
            sched.htick = false;
        }
        self.pipe.propagate_host_tick(cpu);
        emit(self.trace, records::sched::HOST_TICK, false, |p| {
            p.u16(cpu as u16);
        });
    }

    /// Arms the host tick of the calling CPU `delay_ns` from now. The tick
    /// reaches the host once the CPU goes back to the root context.
    pub fn program_host_tick(&mut self, delay_ns: u64) -> Result<()> {
        if !self.cfg.relay_host_tick {
            return Err(CoreError::NotSupported);
        }
        let cpu = self.pipe.current_cpu();
        let htimer = self
            .st
            .scheds
            .get(cpu)
            .and_then(|s| s.htimer)
            .ok_or(CoreError::InvalidArgument("cpu"))?;
        self.timer_start(htimer, delay_ns, None, TimerMode::Relative)
    }

    pub fn stop_host_tick(&mut self) -> Result<()> {
        let cpu = self.pipe.current_cpu();
        let htimer = self
            .st
            .scheds
            .get(cpu)
            .and_then(|s| s.htimer)
            .ok_or(CoreError::InvalidArgument("cpu"))?;
        self.timer_stop(htimer)
    }

    /// One watchdog period elapsed on `cpu`. A thread hogging the CPU for
    /// the configured number of periods is forced out of primary mode.
    pub(crate) fn watchdog_tick(&mut self, cpu: usize) {
        let Some(timeout) = self.cfg.watchdog_timeout else {
            return;
        };
        let Some(sched) = self.st.scheds.get_mut(cpu) else {
            return;
        };
        let Some(curr) = sched.curr else {
            sched.wdcount = 0;
            return;
        };
        sched.wdcount += 1;
        if sched.wdcount < timeout {
            return;
        }
        sched.wdcount = 0;

        emit(self.trace, records::sched::WATCHDOG, true, |p| {
            p.u16(cpu as u16).u32(curr.0);
        });
        let Some(thread) = self.st.threads.get_mut(&curr) else {
            return;
        };
        if thread.state.user {
            thread.info.kicked = true;
            thread.pending_mayday = Some(RelaxReason::Watchdog);
            thread.host.signals.add(SigSet::SIGDEBUG);
            thread.host.sigdebug = Some(RelaxReason::Watchdog);
            self.pipe.raise_mayday(thread.host.pid);
        } else {
            thread.info.canceled = true;
            self.kick(curr);
        }
    }
}
