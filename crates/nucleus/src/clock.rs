//! Clocks and tick delivery.
//!
//! The core clock reads the pipeline's cycle counter and programs the
//! per-CPU hardware timer. Extension clocks wrap a [`ClockDevice`] and
//! program it through the device itself. Each clock owns one timer queue
//! per CPU slot; [`Locked::clock_tick`] drains the queue of the ticking CPU.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use nkpipe::{CpuSet, Pipeline};

use crate::arith::{offset_date, TickScale};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::kernel::{Locked, RealtimeCore};
use crate::timer::{GravityTier, Timer, TimerAction};
use crate::tqueue::{DefaultQueue, TimerQueue};
use crate::trace::{emit, records};
use crate::{make_name, Name};

/// Identifies a registered clock. Ids are never reused, so a handle to a
/// deregistered clock reports [`CoreError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockId(i32);

impl ClockId {
    pub const CORE: ClockId = ClockId(-1);

    pub const fn number(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::CORE {
            f.write_str("core")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// External time source backing an extension clock.
pub trait ClockDevice: Send {
    fn name(&self) -> &str;

    fn read_raw(&self) -> u64;

    /// Ticks per second.
    fn frequency(&self) -> u64;

    /// Arms the next event on `cpu`, `delay` ticks from now.
    fn program_local_shot(&mut self, cpu: usize, delay: u64);

    /// Asks `cpu` to reprogram its event for this clock.
    fn program_remote_shot(&mut self, cpu: usize);
}

/// Anticipation applied to timer dates, per gravity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gravity {
    pub irq: u64,
    pub kernel: u64,
    pub user: u64,
}

impl Gravity {
    pub const fn tier(&self, tier: GravityTier) -> u64 {
        match tier {
            GravityTier::Irq => self.irq,
            GravityTier::Kernel => self.kernel,
            GravityTier::User => self.user,
        }
    }

    fn map(self, f: impl Fn(u64) -> u64) -> Self {
        Self {
            irq: f(self.irq),
            kernel: f(self.kernel),
            user: f(self.user),
        }
    }
}

pub(crate) enum ClockSource {
    Core,
    Device(Box<dyn ClockDevice>),
}

pub(crate) struct Clock {
    pub(crate) name: Name,
    pub(crate) id: ClockId,
    pub(crate) source: ClockSource,
    pub(crate) scale: TickScale,
    pub(crate) queues: Vec<DefaultQueue>,
    /// Absolute date of the last shot programmed per CPU.
    pub(crate) shots: Vec<Option<u64>>,
    /// Wallclock offset in nanoseconds.
    pub(crate) offset: i64,
    /// In ticks.
    pub(crate) gravity: Gravity,
    /// Empty for a global clock.
    pub(crate) affinity: CpuSet,
}

impl Clock {
    pub(crate) fn new(
        name: Name,
        id: ClockId,
        source: ClockSource,
        frequency: u64,
        affinity: CpuSet,
        nr_slots: usize,
        config: &CoreConfig,
    ) -> Result<Self> {
        let mut queues = Vec::new();
        queues
            .try_reserve_exact(nr_slots)
            .map_err(|_| CoreError::OutOfMemory)?;
        for _ in 0..nr_slots {
            let queue = DefaultQueue::with_capacity(config.timer_queue_capacity)
                .map_err(|_| CoreError::OutOfMemory)?;
            queues.push(queue);
        }

        let scale = TickScale::new(frequency);
        let latencies = config.effective_latencies();
        let gravity = Gravity {
            irq: latencies.irq,
            kernel: latencies.kernel,
            user: latencies.user,
        }
        .map(|ns| scale.ns_to_ticks(ns));

        Ok(Self {
            name,
            id,
            source,
            scale,
            queues,
            shots: alloc::vec![None; nr_slots],
            offset: 0,
            gravity,
            affinity,
        })
    }

    pub(crate) fn is_core(&self) -> bool {
        matches!(self.source, ClockSource::Core)
    }

    pub(crate) fn read_raw(&self, pipe: &dyn Pipeline) -> u64 {
        match &self.source {
            ClockSource::Core => pipe.read_cycle_counter(),
            ClockSource::Device(device) => device.read_raw(),
        }
    }

    pub(crate) fn device_name<'a>(&'a self, pipe: &'a dyn Pipeline) -> &'a str {
        match &self.source {
            ClockSource::Core => pipe.name(),
            ClockSource::Device(device) => device.name(),
        }
    }

    /// Queue drained when `cpu` takes a tick from this clock.
    pub(crate) fn tick_queue(&self, cpu: usize) -> usize {
        if self.is_core() || self.affinity.contains(cpu) {
            cpu
        } else {
            0
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub(crate) fn clear_queues(&mut self) {
        for queue in &mut self.queues {
            let keys: Vec<_> = queue.iter().map(|(key, _)| key).collect();
            for key in keys {
                queue.remove(&key);
            }
        }
    }
}

/// Shifts a wallclock-relative timer by `delta` ticks. Periodic timers
/// left a whole period or more behind `now` are forwarded. Periodic timers
/// that already fired and that a backward shift pushed more than one
/// period ahead are pulled back, landing within one period after `now`.
pub(crate) fn shift_timer(timer: &mut Timer, delta: i64, now: u64, gravity: u64) {
    timer.date = offset_date(timer.date, delta.saturating_neg());
    if !timer.status.periodic {
        return;
    }
    timer.start_date = offset_date(timer.start_date, delta.saturating_neg());

    let period = timer.interval.max(1) as i128;
    let diff = now as i128 - (timer.date as i128 + gravity as i128);
    if diff >= period {
        timer.periodic_ticks = timer.periodic_ticks.saturating_add((diff / period) as u64);
        timer.update_date(gravity);
    } else if delta < 0 && timer.status.fired && diff + period < 0 {
        // Never back onto `now`: that period was already served.
        let div = ((-diff - 1) / period) as u64;
        timer.periodic_ticks = timer.periodic_ticks.saturating_sub(div);
        timer.pexpect_ticks = timer.pexpect_ticks.saturating_sub(div);
        timer.update_date(gravity);
    }
}

impl<P: Pipeline> RealtimeCore<P> {
    /// Registers an extension clock. `affinity` restricts the CPUs its
    /// timers may run on; `None` makes it global.
    pub fn register_clock(
        &self,
        name: &str,
        device: Box<dyn ClockDevice>,
        affinity: Option<CpuSet>,
    ) -> Result<ClockId> {
        let (rt_cpus, nr_slots) = {
            let st = self.state.lock();
            (st.rt_cpus, st.nr_slots())
        };
        let affinity = match affinity {
            None => CpuSet::empty(),
            Some(cpus) => {
                let cpus = cpus.and(rt_cpus);
                if cpus.is_empty() {
                    return Err(CoreError::InvalidArgument("clock affinity"));
                }
                cpus
            }
        };

        let frequency = device.frequency();
        let mut clock = Clock::new(
            make_name(name),
            ClockId::CORE,
            ClockSource::Device(device),
            frequency,
            affinity,
            nr_slots,
            &self.config,
        )?;

        let mut st = self.state.lock();
        let id = ClockId(st.next_clock);
        st.next_clock += 1;
        clock.id = id;
        st.clocks.insert(id, clock);
        log::info!("clock {name} registered as #{id} at {frequency} Hz");
        Ok(id)
    }

    /// Removes an extension clock.
    ///
    /// # Panics
    /// If any timer is still queued on the clock.
    pub fn deregister_clock(&self, id: ClockId) -> Result<()> {
        if id == ClockId::CORE {
            return Err(CoreError::InvalidArgument("core clock"));
        }
        let mut st = self.state.lock();
        let clock = st.clocks.get(&id).ok_or(CoreError::NotFound)?;
        assert!(clock.is_idle(), "deregistering clock {} with queued timers", clock.name);
        st.clocks.remove(&id);
        log::info!("clock #{id} deregistered");
        Ok(())
    }

    pub fn clock_by_name(&self, name: &str) -> Option<ClockId> {
        self.state
            .lock()
            .clocks
            .values()
            .find(|c| c.name.as_str() == name)
            .map(|c| c.id)
    }
}

impl Locked<'_> {
    pub(crate) fn clock(&self, id: ClockId) -> Result<&Clock> {
        self.st.clocks.get(&id).ok_or(CoreError::NotFound)
    }

    pub(crate) fn clock_mut(&mut self, id: ClockId) -> Result<&mut Clock> {
        self.st.clocks.get_mut(&id).ok_or(CoreError::NotFound)
    }

    pub fn read_raw(&self, id: ClockId) -> Result<u64> {
        Ok(self.clock(id)?.read_raw(self.pipe))
    }

    /// Monotonic time in nanoseconds.
    pub fn read_monotonic(&self, id: ClockId) -> Result<u64> {
        let clock = self.clock(id)?;
        Ok(clock.scale.ticks_to_ns(clock.read_raw(self.pipe)))
    }

    /// Wallclock time in nanoseconds since the epoch.
    pub fn read_realtime(&self, id: ClockId) -> Result<u64> {
        let clock = self.clock(id)?;
        let mono = clock.scale.ticks_to_ns(clock.read_raw(self.pipe));
        Ok(offset_date(mono, clock.offset))
    }

    pub fn wallclock_offset(&self, id: ClockId) -> Result<i64> {
        Ok(self.clock(id)?.offset)
    }

    pub fn clock_frequency(&self, id: ClockId) -> Result<u64> {
        Ok(self.clock(id)?.scale.frequency())
    }

    /// Duration of one tick in nanoseconds.
    pub fn clock_resolution(&self, id: ClockId) -> Result<u64> {
        Ok(self.clock(id)?.scale.tick_ns())
    }

    pub fn clock_name(&self, id: ClockId) -> Result<Name> {
        Ok(self.clock(id)?.name.clone())
    }

    pub fn clock_affinity(&self, id: ClockId) -> Result<CpuSet> {
        Ok(self.clock(id)?.affinity)
    }

    pub fn ns_to_ticks(&self, id: ClockId, ns: u64) -> Result<u64> {
        Ok(self.clock(id)?.scale.ns_to_ticks(ns))
    }

    pub fn ticks_to_ns(&self, id: ClockId, ticks: u64) -> Result<u64> {
        Ok(self.clock(id)?.scale.ticks_to_ns(ticks))
    }

    /// Absolute date in ticks of the last event programmed for `cpu`.
    pub fn next_shot(&self, id: ClockId, cpu: usize) -> Result<Option<u64>> {
        Ok(self.clock(id)?.shots.get(cpu).copied().flatten())
    }

    /// Gravity in nanoseconds.
    pub fn gravity(&self, id: ClockId) -> Result<Gravity> {
        let clock = self.clock(id)?;
        Ok(clock.gravity.map(|ticks| clock.scale.ticks_to_ns_rounded(ticks)))
    }

    pub fn set_gravity(&mut self, id: ClockId, gravity: Gravity) -> Result<()> {
        let clock = self.clock_mut(id)?;
        let scale = clock.scale;
        clock.gravity = gravity.map(|ns| scale.ns_to_ticks(ns));
        Ok(())
    }

    /// Restores the calibrated gravity of the configured architecture.
    pub fn reset_gravity(&mut self, id: ClockId) -> Result<()> {
        let latencies = self.cfg.effective_latencies();
        self.set_gravity(
            id,
            Gravity {
                irq: latencies.irq,
                kernel: latencies.kernel,
                user: latencies.user,
            },
        )
    }

    /// CPU a new timer of `id` lands on when created from `cpu`.
    pub(crate) fn default_cpu(&self, id: ClockId, cpu: usize) -> Result<usize> {
        let clock = self.clock(id)?;
        let rt_cpus = self.st.rt_cpus;
        let cpu = if clock.is_core() {
            if rt_cpus.contains(cpu) {
                cpu
            } else {
                rt_cpus.first().unwrap_or(0)
            }
        } else if clock.affinity.is_empty() {
            0
        } else if clock.affinity.contains(cpu) {
            cpu
        } else {
            clock.affinity.first().unwrap_or(0)
        };
        Ok(cpu)
    }

    /// Processes every timer of the ticking CPU's queue that is due.
    pub fn clock_tick(&mut self, id: ClockId) -> Result<()> {
        let cpu = self.pipe.current_cpu();
        let (qcpu, mut now) = {
            let clock = self.clock(id)?;
            (clock.tick_queue(cpu), clock.read_raw(self.pipe))
        };
        if qcpu >= self.st.nr_slots() {
            return Err(CoreError::InvalidArgument("cpu"));
        }
        emit(self.trace, records::clock::TICK, true, |p| {
            p.i32(id.number()).u16(qcpu as u16).u64(now);
        });

        self.st.scheds[qcpu].in_tick = true;
        while let Some((key, tid)) = self
            .st
            .clocks
            .get(&id)
            .and_then(|clock| clock.queues[qcpu].head())
        {
            if key.date > now {
                break;
            }
            self.st.dequeue(tid);
            let Some(timer) = self.st.timers.get_mut(&tid) else {
                continue;
            };
            timer.stats.fired += 1;

            if matches!(timer.action, TimerAction::HostTick(_)) {
                let periodic = timer.status.periodic;
                let sched = &mut self.st.scheds[qcpu];
                sched.htick = true;
                sched.hdefer = false;
                if !periodic {
                    timer.status.running = false;
                    continue;
                }
            } else {
                if !timer.status.periodic {
                    timer.status.running = false;
                }
                timer.status.fired = true;
                self.fire_timer(tid);
                if let Some(clock) = self.st.clocks.get(&id) {
                    now = clock.read_raw(self.pipe);
                }

                // Only periodic timers the handler left alone go back in.
                let requeue = match self.st.timers.get(&tid) {
                    None => false,
                    Some(t) if t.status.killed => {
                        self.st.timers.remove(&tid);
                        false
                    }
                    Some(t) => t.status.periodic && t.key.is_none() && t.status.running,
                };
                if !requeue {
                    continue;
                }
            }

            self.st.advance_periodic(tid, now);
            if self.st.enqueue(tid).is_err() {
                continue;
            }
            let tcpu = self.st.timers.get(&tid).map_or(qcpu, |t| t.cpu);
            if tcpu != qcpu && self.st.heading(tid) {
                self.remote_shot(id, tcpu);
            }
        }
        self.st.scheds[qcpu].in_tick = false;
        self.program_shot(id, qcpu);
        Ok(())
    }

    /// Programs the next event of `cpu`'s queue on `id`. Deferred while the
    /// CPU is inside a tick.
    pub(crate) fn program_shot(&mut self, id: ClockId, cpu: usize) {
        let st = &mut *self.st;
        let Some(sched) = st.scheds.get_mut(cpu) else {
            return;
        };
        if sched.in_tick {
            return;
        }
        let Some(clock) = st.clocks.get_mut(&id) else {
            return;
        };
        let queue = &clock.queues[cpu];
        let Some((mut key, mut head)) = queue.head() else {
            sched.idle = true;
            clock.shots[cpu] = None;
            return;
        };

        // The host tick waits while real-time work is pending.
        if clock.is_core()
            && Some(head) == sched.htimer
            && (sched.resched || sched.curr.is_some())
        {
            if let Some(second) = queue.second() {
                (key, head) = second;
                sched.hdefer = true;
            }
        }
        sched.idle = false;

        let delay = key.date.saturating_sub(clock.read_raw(self.pipe));
        match &mut clock.source {
            ClockSource::Core => self.pipe.set_timer_shot(delay),
            ClockSource::Device(device) => device.program_local_shot(cpu, delay),
        }
        clock.shots[cpu] = Some(key.date);
        emit(self.trace, records::clock::PROGRAM, false, |p| {
            p.i32(id.number()).u16(cpu as u16).u32(head.0).u64(key.date);
        });
    }

    /// Asks `cpu` to reprogram its event for `id`.
    pub(crate) fn remote_shot(&mut self, id: ClockId, cpu: usize) {
        let Some(clock) = self.st.clocks.get_mut(&id) else {
            return;
        };
        match &mut clock.source {
            ClockSource::Core => self.pipe.send_timer_ipi(CpuSet::single(cpu)),
            ClockSource::Device(device) => device.program_remote_shot(cpu),
        }
        emit(self.trace, records::clock::REMOTE, false, |p| {
            p.i32(id.number()).u16(cpu as u16);
        });
    }

    /// Shifts every wallclock-relative timer of `id` by `delta_ns`, then
    /// reprograms each CPU.
    pub fn apply_offset(&mut self, id: ClockId, delta_ns: i64) -> Result<()> {
        let current = self.pipe.current_cpu();
        let (delta, now) = {
            let clock = self.clock(id)?;
            (
                clock.scale.ns_to_ticks_signed(delta_ns),
                clock.read_raw(self.pipe),
            )
        };
        emit(self.trace, records::clock::ADJUST, false, |p| {
            p.i32(id.number()).i64(delta);
        });

        for cpu in 0..self.st.nr_slots() {
            let st = &mut *self.st;
            let mut work = core::mem::take(&mut st.scratch);
            work.clear();
            if let Some(clock) = st.clocks.get(&id) {
                work.extend(
                    clock.queues[cpu]
                        .iter()
                        .map(|(_, tid)| tid)
                        .filter(|tid| st.timers.get(tid).is_some_and(|t| t.status.realtime)),
                );
            }
            let touched = !work.is_empty();
            let gravity = st.clocks.get(&id).map(|c| c.gravity);
            let mut result = Ok(());
            for &tid in &work {
                st.dequeue(tid);
                if let (Some(timer), Some(gravity)) = (st.timers.get_mut(&tid), gravity) {
                    shift_timer(timer, delta, now, gravity.tier(timer.tier));
                }
                if let Err(err) = st.enqueue(tid) {
                    result = Err(err);
                }
            }
            st.scratch = work;
            result?;

            if touched {
                if cpu == current {
                    self.program_shot(id, cpu);
                } else {
                    self.remote_shot(id, cpu);
                }
            }
        }
        Ok(())
    }

    /// Sets the wallclock of `id` to `epoch_ns` and shifts its
    /// wallclock-relative timers accordingly.
    pub fn set_wallclock(&mut self, id: ClockId, epoch_ns: u64) -> Result<()> {
        let clock = self.st.clocks.get_mut(&id).ok_or(CoreError::NotFound)?;
        let offset = wallclock_offset(clock, self.pipe, epoch_ns);
        let delta = offset.saturating_sub(clock.offset);
        clock.offset = offset;
        self.apply_offset(id, delta)
    }

    /// Writes the core clock's wallclock back to the host.
    pub fn propagate_wallclock(&mut self) -> Result<()> {
        let now = self.read_realtime(ClockId::CORE)?;
        self.pipe.set_wallclock(now)?;
        Ok(())
    }

    pub(crate) fn init_wallclock(&mut self, id: ClockId) -> Result<()> {
        let epoch = self.pipe.read_wallclock();
        let clock = self.st.clocks.get_mut(&id).ok_or(CoreError::NotFound)?;
        clock.offset = wallclock_offset(clock, self.pipe, epoch);
        Ok(())
    }
}

/// Offset turning the monotonic time of `clock` into `epoch_ns`.
fn wallclock_offset(clock: &Clock, pipe: &dyn Pipeline, epoch_ns: u64) -> i64 {
    let mono = clock.scale.ticks_to_ns(clock.read_raw(pipe));
    (epoch_ns as i128 - mono as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
