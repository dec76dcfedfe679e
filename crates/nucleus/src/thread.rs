//! Thread execution contexts.
//!
//! A thread is a host task the nucleus can run out-of-band. It carries the
//! nucleus view (mode, block conditions, markers, timers, saved registers)
//! and a mirror of the host side it needs to take decisions without
//! calling into the host kernel.

use alloc::boxed::Box;
use alloc::vec::Vec;

use nkpipe::{CpuSet, Pipeline};

use crate::arch::ArchContext;
use crate::clock::ClockId;
use crate::error::{CoreError, Result};
use crate::kernel::{Locked, RealtimeCore};
use crate::timer::{GravityTier, TimerAction, TimerId, TimerMode};
use crate::{make_name, Name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

/// Execution stage of a thread.
///
/// `Relaxing` and `Hardening` only exist inside one locked section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExecMode {
    Primary,
    Relaxing,
    Relaxed,
    Hardening,
    Terminated,
}

/// Why a thread left primary mode. The code is what the diagnostic signal
/// carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RelaxReason {
    Undefined = 0,
    Signal = 1,
    Syscall = 2,
    Fault = 3,
    PriorityInversion = 4,
    NoMlock = 5,
    Watchdog = 6,
    LockBreak = 7,
}

impl RelaxReason {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Undefined,
            1 => Self::Signal,
            2 => Self::Syscall,
            3 => Self::Fault,
            4 => Self::PriorityInversion,
            5 => Self::NoMlock,
            6 => Self::Watchdog,
            7 => Self::LockBreak,
            _ => return None,
        })
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Signal => "signal",
            Self::Syscall => "syscall",
            Self::Fault => "fault",
            Self::PriorityInversion => "pi-error",
            Self::NoMlock => "no-mlock",
            Self::Watchdog => "watchdog",
            Self::LockBreak => "lock-break",
        }
    }
}

/// Host signal set, one bit per signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u64);

impl SigSet {
    pub const SIGINT: u32 = 2;
    pub const SIGTRAP: u32 = 5;
    pub const SIGKILL: u32 = 9;
    pub const SIGSTOP: u32 = 19;
    /// Diagnostic signal raised on unwanted relaxes.
    pub const SIGDEBUG: u32 = 24;
    pub const SIGSHADOW: u32 = 28;

    pub const fn empty() -> Self {
        Self(0)
    }

    const fn bit(sig: u32) -> u64 {
        if sig == 0 || sig > 64 {
            0
        } else {
            1 << (sig - 1)
        }
    }

    pub fn add(&mut self, sig: u32) {
        self.0 |= Self::bit(sig);
    }

    pub fn remove(&mut self, sig: u32) {
        self.0 &= !Self::bit(sig);
    }

    pub const fn contains(self, sig: u32) -> bool {
        Self::bit(sig) != 0 && self.0 & Self::bit(sig) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// A signal stopping a traced task is pending.
    pub const fn stop_pending(self) -> bool {
        self.contains(Self::SIGSTOP) || self.contains(Self::SIGINT) || self.contains(Self::SIGTRAP)
    }
}

/// Conditions keeping a thread off the run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockState {
    pub dormant: bool,
    pub suspended: bool,
    pub delayed: bool,
    pub pending: bool,
    pub dbgstop: bool,
}

impl BlockState {
    pub const fn is_empty(&self) -> bool {
        !(self.dormant || self.suspended || self.delayed || self.pending || self.dbgstop)
    }
}

/// One-shot markers describing what happened to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfoState {
    pub timeo: bool,
    pub broken: bool,
    pub kicked: bool,
    pub canceled: bool,
    pub moved: bool,
    /// Resumed from a debugger stop; overruns are hidden once.
    pub hiccup: bool,
    pub sysrst: bool,
    /// Return to primary mode once the debugger lets go.
    pub conthi: bool,
    pub harden_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub user: bool,
    /// Raise the diagnostic signal on unwanted relaxes.
    pub warn: bool,
    /// Being single-stepped by a debugger.
    pub sstep: bool,
}

/// Host side of a thread, as the nucleus mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostTask {
    pub pid: u32,
    pub process: u32,
    pub cpu: usize,
    pub signals: SigSet,
    pub ptraced: bool,
    /// Sleeping on the host side.
    pub sleeping: bool,
    /// Set when a signal hits the thread while it sleeps on the host side
    /// in primary mode. The host reads it and leaves the task asleep: the
    /// wake-up is the one posted when the thread relaxes, which clears it.
    pub nowakeup: bool,
    /// Reason carried by the last diagnostic signal.
    pub sigdebug: Option<RelaxReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadStats {
    /// Context switches.
    pub csw: u64,
    /// Switches to secondary mode.
    pub ssw: u64,
    pub xsc: u64,
    pub pf: u64,
}

/// Host wake-up posted when a thread relaxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostWake {
    pub thread: ThreadId,
    pub pid: u32,
    pub reason: RelaxReason,
}

#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub name: Name,
    pub priority: i32,
    pub cpu: usize,
    pub affinity: Option<CpuSet>,
    pub user: bool,
    pub warn: bool,
    pub pid: u32,
    pub process: u32,
}

impl ThreadSpec {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: make_name(name),
            priority,
            cpu: 0,
            affinity: None,
            user: true,
            warn: false,
            pid: 0,
            process: 0,
        }
    }

    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn affinity(mut self, cpus: CpuSet) -> Self {
        self.affinity = Some(cpus);
        self
    }

    pub fn kernel(mut self) -> Self {
        self.user = false;
        self
    }

    pub fn warn(mut self) -> Self {
        self.warn = true;
        self
    }

    pub fn host(mut self, pid: u32, process: u32) -> Self {
        self.pid = pid;
        self.process = process;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub id: ThreadId,
    pub name: Name,
    pub priority: i32,
    pub mode: ExecMode,
    pub cpu: usize,
    pub affinity: CpuSet,
    pub blocks: BlockState,
    pub info: InfoState,
    pub state: StateFlags,
    pub host: HostTask,
    pub stats: ThreadStats,
    pub last_relax: Option<RelaxReason>,
    pub pending_mayday: Option<RelaxReason>,
    pub rtimer: TimerId,
    pub ptimer: TimerId,
    pub window_size: usize,
    pub ctx: ArchContext,
}

/// Outcome of [`Locked::wait_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodWait {
    /// The thread now waits for the next period; finish with
    /// [`Locked::finish_wait_period`] once it runs again.
    Suspended,
    /// The period had already elapsed; carries the overruns.
    Elapsed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Block {
    Suspended,
    Delayed,
    Pending,
    DbgStop,
}

pub(crate) struct Thread {
    pub(crate) name: Name,
    pub(crate) priority: i32,
    pub(crate) mode: ExecMode,
    pub(crate) blocks: BlockState,
    pub(crate) info: InfoState,
    pub(crate) state: StateFlags,
    pub(crate) affinity: CpuSet,
    pub(crate) cpu: usize,
    pub(crate) rtimer: TimerId,
    pub(crate) ptimer: TimerId,
    pub(crate) host: HostTask,
    pub(crate) stats: ThreadStats,
    pub(crate) last_relax: Option<RelaxReason>,
    pub(crate) pending_mayday: Option<RelaxReason>,
    pub(crate) u_window: Option<Box<[u8]>>,
    pub(crate) ctx: ArchContext,
}

impl Thread {
    pub(crate) fn is_ready(&self) -> bool {
        self.mode == ExecMode::Primary && self.blocks.is_empty()
    }

    fn flag(&mut self, cond: Block) -> &mut bool {
        match cond {
            Block::Suspended => &mut self.blocks.suspended,
            Block::Delayed => &mut self.blocks.delayed,
            Block::Pending => &mut self.blocks.pending,
            Block::DbgStop => &mut self.blocks.dbgstop,
        }
    }

    fn view(&self, id: ThreadId) -> ThreadView {
        ThreadView {
            id,
            name: self.name.clone(),
            priority: self.priority,
            mode: self.mode,
            cpu: self.cpu,
            affinity: self.affinity,
            blocks: self.blocks,
            info: self.info,
            state: self.state,
            host: self.host,
            stats: self.stats,
            last_relax: self.last_relax,
            pending_mayday: self.pending_mayday,
            rtimer: self.rtimer,
            ptimer: self.ptimer,
            window_size: self.u_window.as_ref().map_or(0, |w| w.len()),
            ctx: self.ctx,
        }
    }
}

impl<P: Pipeline> RealtimeCore<P> {
    /// Maps a host task into the nucleus. The thread starts relaxed, with
    /// its shared memory window allocated.
    pub fn register_thread(&self, spec: ThreadSpec) -> Result<ThreadId> {
        let size = self.config.u_window_size;
        let mut window = Vec::new();
        window
            .try_reserve_exact(size)
            .map_err(|_| CoreError::OutOfMemory)?;
        window.resize(size, 0u8);

        let name = spec.name.clone();
        let tid = self.atomic(|nk| nk.insert_thread(spec, window.into_boxed_slice()))?;
        log::debug!("thread {name} mapped as #{}", tid.0);
        Ok(tid)
    }

    pub fn thread_view(&self, tid: ThreadId) -> Result<ThreadView> {
        self.atomic(|nk| nk.thread_view(tid))
    }
}

impl Locked<'_> {
    fn insert_thread(&mut self, spec: ThreadSpec, window: Box<[u8]>) -> Result<ThreadId> {
        let rt_cpus = self.st.rt_cpus;
        if !rt_cpus.contains(spec.cpu) {
            return Err(CoreError::InvalidArgument("cpu"));
        }
        let affinity = spec.affinity.unwrap_or(rt_cpus).and(rt_cpus);
        if !affinity.contains(spec.cpu) {
            return Err(CoreError::InvalidArgument("affinity"));
        }

        let tid = ThreadId(self.st.next_thread);
        let tier = if spec.user {
            GravityTier::User
        } else {
            GravityTier::Kernel
        };
        let rtimer = self.timer_create(ClockId::CORE, "[rtimer]", tier, TimerAction::ThreadTimeout(tid))?;
        let ptimer = match self.timer_create(ClockId::CORE, "[ptimer]", tier, TimerAction::ThreadPeriod(tid)) {
            Ok(ptimer) => ptimer,
            Err(err) => {
                self.timer_destroy(rtimer)?;
                return Err(err);
            }
        };
        for timer in [rtimer, ptimer] {
            if let Some(timer) = self.st.timers.get_mut(&timer) {
                timer.cpu = spec.cpu;
            }
        }
        self.st.next_thread += 1;

        self.st.threads.insert(
            tid,
            Thread {
                name: spec.name,
                priority: spec.priority,
                mode: ExecMode::Relaxed,
                blocks: BlockState::default(),
                info: InfoState::default(),
                state: StateFlags {
                    user: spec.user,
                    warn: spec.warn,
                    sstep: false,
                },
                affinity,
                cpu: spec.cpu,
                rtimer,
                ptimer,
                host: HostTask {
                    pid: spec.pid,
                    process: spec.process,
                    cpu: spec.cpu,
                    ..HostTask::default()
                },
                stats: ThreadStats::default(),
                last_relax: None,
                pending_mayday: None,
                u_window: Some(window),
                ctx: ArchContext::default(),
            },
        );
        Ok(tid)
    }

    pub(crate) fn thread_ref(&self, tid: ThreadId) -> Result<&Thread> {
        self.st.threads.get(&tid).ok_or(CoreError::NotFound)
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut Thread> {
        self.st.threads.get_mut(&tid).ok_or(CoreError::NotFound)
    }

    pub fn thread_view(&self, tid: ThreadId) -> Result<ThreadView> {
        Ok(self.thread_ref(tid)?.view(tid))
    }

    pub fn thread_mode(&self, tid: ThreadId) -> Result<ExecMode> {
        Ok(self.thread_ref(tid)?.mode)
    }

    /// Whether `tid` is what its CPU currently runs out-of-band.
    pub(crate) fn is_current(&self, tid: ThreadId) -> bool {
        self.st
            .threads
            .get(&tid)
            .and_then(|t| self.st.scheds.get(t.cpu))
            .is_some_and(|s| s.curr == Some(tid))
    }

    /// Adds `cond` to the block conditions of `tid`, optionally bounded by
    /// a timeout on the resource timer.
    pub(crate) fn block(
        &mut self,
        tid: ThreadId,
        cond: Block,
        timeout: Option<(u64, TimerMode)>,
    ) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        let waits = matches!(cond, Block::Delayed | Block::Pending);
        if waits {
            // A kicked thread on its way out of primary mode never sleeps.
            if thread.info.kicked && thread.state.user && thread.mode == ExecMode::Primary {
                thread.info.broken = true;
                return Ok(());
            }
            thread.info.timeo = false;
            thread.info.broken = false;
        }
        *thread.flag(cond) = true;
        let (cpu, rtimer) = (thread.cpu, thread.rtimer);

        if let Some((value, mode)) = timeout {
            match self.timer_start(rtimer, value, None, mode) {
                Ok(()) => {}
                Err(CoreError::TimedOut) => {
                    let thread = self.thread_mut(tid)?;
                    *thread.flag(cond) = false;
                    thread.info.timeo = true;
                    return Ok(());
                }
                Err(err) => {
                    *self.thread_mut(tid)?.flag(cond) = false;
                    return Err(err);
                }
            }
        }
        self.set_resched(cpu);
        Ok(())
    }

    /// Clears `cond`. The resource timer is stopped once the thread no
    /// longer waits on anything.
    pub(crate) fn unblock_cond(&mut self, tid: ThreadId, cond: Block) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        *thread.flag(cond) = false;
        let waits = thread.blocks.delayed || thread.blocks.pending;
        let (cpu, rtimer, ready) = (thread.cpu, thread.rtimer, thread.is_ready());
        if matches!(cond, Block::Delayed | Block::Pending) && !waits {
            self.timer_stop(rtimer)?;
        }
        if ready {
            self.set_resched(cpu);
        }
        Ok(())
    }

    pub fn suspend(&mut self, tid: ThreadId) -> Result<()> {
        self.block(tid, Block::Suspended, None)
    }

    pub fn resume(&mut self, tid: ThreadId) -> Result<()> {
        self.unblock_cond(tid, Block::Suspended)
    }

    /// Puts `tid` to sleep for `ns` nanoseconds.
    pub fn delay(&mut self, tid: ThreadId, ns: u64) -> Result<()> {
        if ns == 0 {
            return Ok(());
        }
        self.block(tid, Block::Delayed, Some((ns, TimerMode::Relative)))
    }

    /// Breaks a delay or a resource wait. Returns whether `tid` was waiting.
    pub fn unblock(&mut self, tid: ThreadId) -> Result<bool> {
        let thread = self.thread_ref(tid)?;
        let (delayed, pending) = (thread.blocks.delayed, thread.blocks.pending);
        if !delayed && !pending {
            return Ok(false);
        }
        if delayed {
            self.unblock_cond(tid, Block::Delayed)?;
        }
        if pending {
            self.unblock_cond(tid, Block::Pending)?;
        }
        self.thread_mut(tid)?.info.broken = true;
        Ok(true)
    }

    /// Makes `tid` periodic: first release at `idate` (monotonic ns, `None`
    /// for one period from now), then every `period` ns. `None` or zero
    /// stops the periodic timer.
    pub fn set_periodic(
        &mut self,
        tid: ThreadId,
        idate: Option<u64>,
        period: Option<u64>,
    ) -> Result<()> {
        let thread = self.thread_ref(tid)?;
        let (ptimer, cpu, user) = (thread.ptimer, thread.cpu, thread.state.user);
        let Some(period) = period.filter(|p| *p > 0) else {
            return self.timer_stop(ptimer);
        };
        let tier = if user {
            GravityTier::User
        } else {
            GravityTier::Kernel
        };
        if period < self.gravity(ClockId::CORE)?.tier(tier) {
            return Err(CoreError::InvalidArgument("period below gravity"));
        }

        self.timer_stop(ptimer)?;
        if let Some(timer) = self.st.timers.get_mut(&ptimer) {
            timer.cpu = cpu;
        }
        match idate {
            None => self.timer_start(ptimer, period, Some(period), TimerMode::Relative),
            Some(date) => self.timer_start(ptimer, date, Some(period), TimerMode::Absolute),
        }
    }

    /// Waits for the next release of a periodic thread.
    pub fn wait_period(&mut self, tid: ThreadId) -> Result<PeriodWait> {
        let ptimer = self.thread_ref(tid)?.ptimer;
        let timer = self.st.timers.get(&ptimer).ok_or(CoreError::NotFound)?;
        if !timer.status.running {
            return Err(CoreError::WouldBlock);
        }
        let now = self.read_raw(timer.clock)?;
        if now < timer.pexpect() {
            self.block(tid, Block::Delayed, None)?;
            return Ok(PeriodWait::Suspended);
        }
        let overruns = self.timer_get_overruns(ptimer, Some(tid), now)?;
        Ok(PeriodWait::Elapsed(overruns))
    }

    /// Completes a [`PeriodWait::Suspended`] wait once the thread runs
    /// again. Returns the overruns.
    pub fn finish_wait_period(&mut self, tid: ThreadId) -> Result<u64> {
        let thread = self.thread_mut(tid)?;
        if thread.blocks.delayed {
            return Err(CoreError::WouldBlock);
        }
        if thread.info.broken {
            thread.info.broken = false;
            return Err(CoreError::Interrupted);
        }
        let ptimer = thread.ptimer;
        let clock = self
            .st
            .timers
            .get(&ptimer)
            .ok_or(CoreError::NotFound)?
            .clock;
        let now = self.read_raw(clock)?;
        self.timer_get_overruns(ptimer, Some(tid), now)
    }

    /// Resource timer expiry.
    pub(crate) fn thread_timeout(&mut self, tid: ThreadId) {
        let Ok(thread) = self.thread_mut(tid) else {
            return;
        };
        thread.info.timeo = true;
        let (delayed, pending) = (thread.blocks.delayed, thread.blocks.pending);
        if delayed {
            let _ = self.unblock_cond(tid, Block::Delayed);
        }
        if pending {
            let _ = self.unblock_cond(tid, Block::Pending);
        }
    }

    /// Periodic timer expiry. The timer is out of its queue here, so moving
    /// it to the thread's CPU lets the tick requeue it there.
    pub(crate) fn thread_period_elapsed(&mut self, tid: ThreadId, ptimer: TimerId) {
        let Ok(thread) = self.thread_ref(tid) else {
            return;
        };
        let (cpu, delayed, pending) = (thread.cpu, thread.blocks.delayed, thread.blocks.pending);
        if delayed && !pending {
            let _ = self.unblock_cond(tid, Block::Delayed);
        }
        if let Some(timer) = self.st.timers.get_mut(&ptimer) {
            if timer.cpu != cpu && timer.key.is_none() {
                timer.cpu = cpu;
            }
        }
    }

    /// Host-side ptrace attach or detach.
    pub fn set_ptraced(&mut self, tid: ThreadId, ptraced: bool) -> Result<()> {
        self.thread_mut(tid)?.host.ptraced = ptraced;
        Ok(())
    }

    /// Host-side sleep state of the task.
    pub fn set_host_sleeping(&mut self, tid: ThreadId, sleeping: bool) -> Result<()> {
        self.thread_mut(tid)?.host.sleeping = sleeping;
        Ok(())
    }

    /// The host delivered every pending signal of `tid`.
    pub fn clear_host_signals(&mut self, tid: ThreadId) -> Result<()> {
        self.thread_mut(tid)?.host.signals = SigSet::empty();
        Ok(())
    }
}
