//! Timer engine.
//!
//! A timer sits in at most one queue: the one of its clock for the CPU it
//! is bound to. Dates are raw clock ticks already anticipated by the
//! timer's gravity. Periodic timers keep their first expiry in
//! `start_date` and derive every later date from it, so reloading never
//! accumulates drift.

use alloc::boxed::Box;

use crate::arith::offset_date;
use crate::clock::ClockId;
use crate::error::{CoreError, Result};
use crate::kernel::{CoreState, Locked};
use crate::thread::ThreadId;
use crate::tqueue::{QueueKey, TimerQueue};
use crate::trace::{emit, records};
use crate::{make_name, Name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u32);

/// How the start value of [`Locked::timer_start`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Nanoseconds from now.
    Relative,
    /// Monotonic date in nanoseconds.
    Absolute,
    /// Wallclock date in nanoseconds; follows wallclock adjustments.
    Realtime,
}

/// Execution context woken by a timer, selecting the gravity it gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GravityTier {
    Irq,
    Kernel,
    #[default]
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerStatus {
    pub running: bool,
    pub dequeued: bool,
    pub periodic: bool,
    pub fired: bool,
    pub killed: bool,
    pub realtime: bool,
}

impl Default for TimerStatus {
    fn default() -> Self {
        Self {
            running: false,
            dequeued: true,
            periodic: false,
            fired: false,
            killed: false,
            realtime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerStats {
    pub scheduled: u64,
    pub fired: u64,
}

/// Expiry handler. Runs with the nucleus lock held.
pub type TimerHandler = Box<dyn FnMut(&mut Locked<'_>, TimerId) + Send>;

pub(crate) enum TimerAction {
    /// Taken out while the handler runs.
    Callback(Option<TimerHandler>),
    ThreadTimeout(ThreadId),
    ThreadPeriod(ThreadId),
    HostTick(usize),
    Watchdog(usize),
}

pub(crate) struct Timer {
    pub(crate) name: Name,
    pub(crate) clock: ClockId,
    pub(crate) cpu: usize,
    pub(crate) date: u64,
    pub(crate) start_date: u64,
    /// Period in ticks, zero for one-shot timers.
    pub(crate) interval: u64,
    pub(crate) interval_ns: Option<u64>,
    pub(crate) periodic_ticks: u64,
    pub(crate) pexpect_ticks: u64,
    pub(crate) prio: i32,
    pub(crate) tier: GravityTier,
    pub(crate) status: TimerStatus,
    pub(crate) key: Option<QueueKey>,
    pub(crate) action: TimerAction,
    pub(crate) stats: TimerStats,
}

impl Timer {
    pub(crate) fn update_date(&mut self, gravity: u64) {
        self.date = self
            .start_date
            .saturating_add(self.interval.saturating_mul(self.periodic_ticks))
            .saturating_sub(gravity);
    }

    /// Date the next expiry is expected at, for overrun accounting.
    pub(crate) fn pexpect(&self) -> u64 {
        self.start_date
            .saturating_add(self.interval.saturating_mul(self.pexpect_ticks))
    }
}

impl CoreState {
    pub(crate) fn create_timer(
        &mut self,
        clock: ClockId,
        name: Name,
        tier: GravityTier,
        action: TimerAction,
        cpu: usize,
    ) -> Result<TimerId> {
        if !self.clocks.contains_key(&clock) {
            return Err(CoreError::NotFound);
        }
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert(
            id,
            Timer {
                name,
                clock,
                cpu,
                date: 0,
                start_date: 0,
                interval: 0,
                interval_ns: None,
                periodic_ticks: 0,
                pexpect_ticks: 0,
                prio: 0,
                tier,
                status: TimerStatus::default(),
                key: None,
                action,
                stats: TimerStats::default(),
            },
        );
        Ok(id)
    }

    pub(crate) fn enqueue(&mut self, tid: TimerId) -> Result<()> {
        self.dequeue(tid);
        let timer = self.timers.get_mut(&tid).ok_or(CoreError::NotFound)?;
        let queue = self
            .clocks
            .get_mut(&timer.clock)
            .ok_or(CoreError::NotFound)?
            .queues
            .get_mut(timer.cpu)
            .ok_or(CoreError::InvalidArgument("cpu"))?;
        timer.key = Some(queue.insert(timer.date, timer.prio, tid));
        timer.status.dequeued = false;
        timer.stats.scheduled += 1;
        Ok(())
    }

    /// Removes `tid` from its queue. Returns whether it was queued.
    pub(crate) fn dequeue(&mut self, tid: TimerId) -> bool {
        let Some(timer) = self.timers.get_mut(&tid) else {
            return false;
        };
        timer.status.dequeued = true;
        let Some(key) = timer.key.take() else {
            return false;
        };
        if let Some(queue) = self
            .clocks
            .get_mut(&timer.clock)
            .and_then(|clock| clock.queues.get_mut(timer.cpu))
        {
            queue.remove(&key);
        }
        true
    }

    /// Whether `tid` decides the next shot of its CPU.
    pub(crate) fn heading(&self, tid: TimerId) -> bool {
        let Some(timer) = self.timers.get(&tid) else {
            return false;
        };
        let Some(key) = timer.key else {
            return false;
        };
        let Some(queue) = self
            .clocks
            .get(&timer.clock)
            .and_then(|clock| clock.queues.get(timer.cpu))
        else {
            return false;
        };
        if queue.head().map(|(k, _)| k) == Some(key) {
            return true;
        }
        let hdefer = self.scheds.get(timer.cpu).is_some_and(|s| s.hdefer);
        hdefer && queue.second().map(|(k, _)| k) == Some(key)
    }

    fn gravity_of(&self, tid: TimerId) -> u64 {
        self.timers
            .get(&tid)
            .and_then(|t| {
                self.clocks
                    .get(&t.clock)
                    .map(|clock| clock.gravity.tier(t.tier))
            })
            .unwrap_or(0)
    }

    /// Moves a periodic timer to its first period strictly after `now`.
    pub(crate) fn advance_periodic(&mut self, tid: TimerId, now: u64) {
        let gravity = self.gravity_of(tid);
        if let Some(timer) = self.timers.get_mut(&tid) {
            loop {
                timer.periodic_ticks += 1;
                timer.update_date(gravity);
                if timer.date > now {
                    break;
                }
            }
        }
    }
}

impl Locked<'_> {
    /// Creates a disarmed timer on `clock`, bound to the clock's default
    /// CPU for the calling CPU.
    pub fn timer_init(
        &mut self,
        clock: ClockId,
        name: &str,
        tier: GravityTier,
        handler: TimerHandler,
    ) -> Result<TimerId> {
        self.timer_create(clock, name, tier, TimerAction::Callback(Some(handler)))
    }

    pub(crate) fn timer_create(
        &mut self,
        clock: ClockId,
        name: &str,
        tier: GravityTier,
        action: TimerAction,
    ) -> Result<TimerId> {
        let cpu = self.default_cpu(clock, self.pipe.current_cpu())?;
        let tid = self
            .st
            .create_timer(clock, make_name(name), tier, action, cpu)?;
        emit(self.trace, records::timer::INIT, false, |p| {
            p.u32(tid.0).i32(clock.number()).u16(cpu as u16);
        });
        Ok(tid)
    }

    /// Stops and releases `tid`. A timer destroyed from its own handler is
    /// reaped once the handler returns and never re-enters a queue.
    pub fn timer_destroy(&mut self, tid: TimerId) -> Result<()> {
        self.timer_stop(tid)?;
        let timer = self.st.timers.get_mut(&tid).ok_or(CoreError::NotFound)?;
        timer.status.killed = true;
        timer.action = TimerAction::Callback(None);
        if self.st.firing != Some(tid) {
            self.st.timers.remove(&tid);
        }
        emit(self.trace, records::timer::DESTROY, false, |p| {
            p.u32(tid.0);
        });
        Ok(())
    }

    /// Arms `tid`. `interval` in nanoseconds makes it periodic; `None` or
    /// `Some(0)` is one-shot. An absolute or wallclock date already past
    /// fails with [`CoreError::TimedOut`] for one-shot timers; periodic
    /// timers skip to their next period.
    pub fn timer_start(
        &mut self,
        tid: TimerId,
        value: u64,
        interval: Option<u64>,
        mode: TimerMode,
    ) -> Result<()> {
        let interval = interval.filter(|ns| *ns > 0);
        let st = &mut *self.st;
        if st.timers.get(&tid).ok_or(CoreError::NotFound)?.status.killed {
            return Err(CoreError::NotFound);
        }
        let heading = st.heading(tid);
        let queued = st.dequeue(tid);

        let timer = st.timers.get_mut(&tid).ok_or(CoreError::NotFound)?;
        let clock = st.clocks.get(&timer.clock).ok_or(CoreError::NotFound)?;
        let scale = clock.scale;
        let now = clock.read_raw(self.pipe);
        let period = interval.map(|ns| scale.ns_to_ticks(ns).max(1));

        timer.status.realtime = false;
        timer.status.fired = false;
        timer.status.periodic = false;

        let date = match mode {
            TimerMode::Relative => scale.ns_to_ticks(value).saturating_add(now),
            TimerMode::Absolute | TimerMode::Realtime => {
                let value = if mode == TimerMode::Realtime {
                    timer.status.realtime = true;
                    offset_date(value, clock.offset.saturating_neg())
                } else {
                    value
                };
                let mut date = scale.ns_to_ticks(value);
                if date <= now {
                    let Some(period) = period else {
                        timer.status.running = false;
                        timer.status.realtime = false;
                        let (clock, cpu) = (timer.clock, timer.cpu);
                        if queued && heading && cpu == self.pipe.current_cpu() {
                            self.program_shot(clock, cpu);
                        }
                        return Err(CoreError::TimedOut);
                    };
                    // Late on arrival: wait for the next period.
                    date = date.saturating_add(period.saturating_mul((now - date) / period + 1));
                }
                date
            }
        };

        let gravity = clock.gravity.tier(timer.tier);
        timer.date = date.saturating_sub(gravity);
        if now >= timer.date {
            timer.date += gravity / 2;
        }
        timer.start_date = date;
        timer.interval = period.unwrap_or(0);
        timer.interval_ns = interval;
        timer.periodic_ticks = 0;
        timer.pexpect_ticks = 0;
        timer.status.periodic = period.is_some();
        timer.status.running = true;

        let timer_date = timer.date;
        emit(self.trace, records::timer::START, true, |p| {
            p.u32(tid.0).u64(timer_date).u64(interval.unwrap_or(0));
        });
        self.enqueue_and_program(tid)
    }

    /// Disarms `tid`. Stopping a stopped timer is a no-op.
    pub fn timer_stop(&mut self, tid: TimerId) -> Result<()> {
        let current = self.pipe.current_cpu();
        let st = &mut *self.st;
        if !st.timers.contains_key(&tid) {
            return Err(CoreError::NotFound);
        }
        let heading = st.heading(tid);
        let queued = st.dequeue(tid);
        let timer = st.timers.get_mut(&tid).ok_or(CoreError::NotFound)?;
        timer.status.running = false;
        timer.status.fired = false;
        let (clock, cpu) = (timer.clock, timer.cpu);

        if queued {
            emit(self.trace, records::timer::STOP, false, |p| {
                p.u32(tid.0);
            });
        }
        // A timer heading another CPU's queue just lets that CPU tick.
        if queued && heading && cpu == current {
            self.program_shot(clock, cpu);
        }
        Ok(())
    }

    pub(crate) fn enqueue_and_program(&mut self, tid: TimerId) -> Result<()> {
        self.st.enqueue(tid)?;
        if !self.st.heading(tid) {
            return Ok(());
        }
        let timer = self.st.timers.get(&tid).ok_or(CoreError::NotFound)?;
        let (clock, cpu) = (timer.clock, timer.cpu);
        if cpu == self.pipe.current_cpu() {
            self.program_shot(clock, cpu);
        } else {
            self.remote_shot(clock, cpu);
        }
        Ok(())
    }

    fn timer(&self, tid: TimerId) -> Result<&Timer> {
        self.st.timers.get(&tid).ok_or(CoreError::NotFound)
    }

    /// Expiry date in nanoseconds, `None` when disarmed.
    pub fn timer_get_date(&self, tid: TimerId) -> Result<Option<u64>> {
        let timer = self.timer(tid)?;
        if !timer.status.running {
            return Ok(None);
        }
        Ok(Some(self.clock(timer.clock)?.scale.ticks_to_ns(timer.date)))
    }

    /// Time left before expiry in nanoseconds, `None` when disarmed. A due
    /// timer that has not been serviced yet reports one nanosecond.
    pub fn timer_get_timeout(&self, tid: TimerId) -> Result<Option<u64>> {
        let timer = self.timer(tid)?;
        if !timer.status.running {
            return Ok(None);
        }
        let clock = self.clock(timer.clock)?;
        let now = clock.read_raw(self.pipe);
        if timer.date <= now {
            return Ok(Some(1));
        }
        Ok(Some(clock.scale.ticks_to_ns(timer.date - now)))
    }

    /// Reload period in nanoseconds, `None` for one-shot or disarmed timers.
    pub fn timer_get_interval(&self, tid: TimerId) -> Result<Option<u64>> {
        let timer = self.timer(tid)?;
        if !timer.status.running {
            return Ok(None);
        }
        Ok(timer.interval_ns)
    }

    /// Counts the periods of `tid` elapsed and not yet consumed at `now`
    /// (raw ticks), then consumes the current one. A `waiter` resuming from
    /// a debugger stop gets 0.
    pub fn timer_get_overruns(
        &mut self,
        tid: TimerId,
        waiter: Option<ThreadId>,
        now: u64,
    ) -> Result<u64> {
        let st = &mut *self.st;
        let timer = st.timers.get(&tid).ok_or(CoreError::NotFound)?;
        if !timer.status.periodic {
            return Ok(0);
        }
        let period = timer.interval;
        let pexpect = timer.pexpect();
        let running = timer.status.running;

        let mut overruns = 0;
        if now >= pexpect && now - pexpect >= period {
            overruns = (now - pexpect) / period;
            let gravity = st.gravity_of(tid);
            if let Some(timer) = st.timers.get_mut(&tid) {
                timer.pexpect_ticks += overruns;
            }
            if running {
                st.dequeue(tid);
                if let Some(timer) = st.timers.get_mut(&tid) {
                    while timer.date <= now {
                        timer.periodic_ticks += 1;
                        timer.update_date(gravity);
                    }
                }
                self.enqueue_and_program(tid)?;
            }
        }

        if let Some(timer) = self.st.timers.get_mut(&tid) {
            timer.pexpect_ticks += 1;
        }
        if let Some(thread) = waiter.and_then(|t| self.st.threads.get_mut(&t)) {
            if thread.info.hiccup {
                thread.info.hiccup = false;
                return Ok(0);
            }
        }
        Ok(overruns)
    }

    /// Rebinds `tid` to `cpu`, keeping it armed. The CPU is clamped to the
    /// clock's affinity; timers of a global extension clock stay on CPU0.
    pub fn timer_migrate(&mut self, tid: TimerId, cpu: usize) -> Result<()> {
        let timer = self.timer(tid)?;
        let clock_id = timer.clock;
        let clock = self.clock(clock_id)?;
        let cpu = if clock.is_core() {
            if !self.st.rt_cpus.contains(cpu) {
                return Err(CoreError::InvalidArgument("cpu"));
            }
            cpu
        } else if clock.affinity.is_empty() {
            0
        } else if clock.affinity.contains(cpu) {
            cpu
        } else {
            clock.affinity.first().unwrap_or(0)
        };
        if timer.cpu == cpu {
            return Ok(());
        }

        let (running, origin) = (timer.status.running, timer.cpu);
        let st = &mut *self.st;
        let heading = st.heading(tid);
        st.dequeue(tid);
        if let Some(timer) = st.timers.get_mut(&tid) {
            timer.cpu = cpu;
        }
        emit(self.trace, records::timer::MIGRATE, false, |p| {
            p.u32(tid.0).u16(cpu as u16);
        });
        if heading && origin == self.pipe.current_cpu() {
            self.program_shot(clock_id, origin);
        }
        if running {
            self.enqueue_and_program(tid)?;
        }
        Ok(())
    }

    /// Changes the tie-break priority of `tid` among timers due at the same
    /// date. Higher runs first.
    pub fn timer_set_priority(&mut self, tid: TimerId, prio: i32) -> Result<()> {
        let timer = self.st.timers.get_mut(&tid).ok_or(CoreError::NotFound)?;
        timer.prio = prio;
        if timer.key.is_some() {
            self.st.enqueue(tid)?;
        }
        Ok(())
    }

    pub fn timer_status(&self, tid: TimerId) -> Result<TimerStatus> {
        Ok(self.timer(tid)?.status)
    }

    pub fn timer_is_running(&self, tid: TimerId) -> Result<bool> {
        Ok(self.timer(tid)?.status.running)
    }

    pub fn timer_stats(&self, tid: TimerId) -> Result<TimerStats> {
        Ok(self.timer(tid)?.stats)
    }

    pub fn timer_cpu(&self, tid: TimerId) -> Result<usize> {
        Ok(self.timer(tid)?.cpu)
    }

    pub fn timer_clock(&self, tid: TimerId) -> Result<ClockId> {
        Ok(self.timer(tid)?.clock)
    }

    pub fn timer_name(&self, tid: TimerId) -> Result<Name> {
        Ok(self.timer(tid)?.name.clone())
    }

    /// Raw expiry date in ticks, gravity applied.
    pub fn timer_raw_date(&self, tid: TimerId) -> Result<u64> {
        Ok(self.timer(tid)?.date)
    }

    /// Number of periods elapsed since the timer was started.
    pub fn timer_periodic_ticks(&self, tid: TimerId) -> Result<u64> {
        Ok(self.timer(tid)?.periodic_ticks)
    }

    /// Runs the expiry action of `tid`.
    pub(crate) fn fire_timer(&mut self, tid: TimerId) {
        let Some(timer) = self.st.timers.get_mut(&tid) else {
            return;
        };
        let date = timer.date;
        emit(self.trace, records::timer::EXPIRE, true, |p| {
            p.u32(tid.0).u64(date);
        });

        match timer.action {
            TimerAction::Callback(ref mut slot) => {
                let Some(mut handler) = slot.take() else {
                    return;
                };
                let outer = self.st.firing.replace(tid);
                handler(self, tid);
                self.st.firing = outer;
                if let Some(timer) = self.st.timers.get_mut(&tid) {
                    if let TimerAction::Callback(slot) = &mut timer.action {
                        if slot.is_none() && !timer.status.killed {
                            *slot = Some(handler);
                        }
                    }
                }
            }
            TimerAction::ThreadTimeout(thread) => self.thread_timeout(thread),
            TimerAction::ThreadPeriod(thread) => self.thread_period_elapsed(thread, tid),
            TimerAction::Watchdog(cpu) => self.watchdog_tick(cpu),
            TimerAction::HostTick(_) => {}
        }
    }
}
