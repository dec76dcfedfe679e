//! The nucleus object, its lock and bring-up/teardown.
//!
//! A [`RealtimeCore`] owns the pipeline, the configuration and every table
//! the nucleus keeps (clocks, timers, threads, interrupt lines, per-CPU
//! scheduler slots) behind a single lock. Operations that may run from
//! out-of-band context are methods of [`Locked`], obtained through
//! [`RealtimeCore::atomic`]; operations that allocate or sleep live on the
//! core itself.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use nkpipe::{CpuSet, Pipeline, SirqId};

use crate::arith::NSEC_PER_SEC;
use crate::clock::{Clock, ClockId, ClockSource};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::intr::{Intr, IntrId, IrqLine};
use crate::make_name;
use crate::sched::Sched;
use crate::sync::{Arc, Mutex};
use crate::thread::{HostWake, Thread, ThreadId};
use crate::timer::{GravityTier, Timer, TimerAction, TimerId, TimerMode};
use crate::trace::TraceHook;

/// Host wake-ups queued from primary mode, handed over to the in-band
/// stage by the wake soft IRQ.
pub(crate) struct InbandWork {
    pending: Mutex<Vec<HostWake>>,
    delivered: Mutex<Vec<HostWake>>,
}

impl InbandWork {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(capacity)),
            delivered: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn queue(&self, wake: HostWake) {
        self.pending.lock().push(wake);
    }

    fn flush(&self) {
        let mut pending = self.pending.lock();
        self.delivered.lock().append(&mut pending);
    }

    fn take_delivered(&self) -> Vec<HostWake> {
        core::mem::take(&mut *self.delivered.lock())
    }
}

/// Everything guarded by the nucleus lock.
pub(crate) struct CoreState {
    pub(crate) clocks: BTreeMap<ClockId, Clock>,
    pub(crate) next_clock: i32,
    pub(crate) timers: BTreeMap<TimerId, Timer>,
    pub(crate) next_timer: u32,
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) next_thread: u32,
    pub(crate) intrs: BTreeMap<IntrId, Intr>,
    pub(crate) next_intr: u32,
    pub(crate) lines: BTreeMap<u32, IrqLine>,
    pub(crate) scheds: Vec<Sched>,
    pub(crate) online: CpuSet,
    pub(crate) rt_cpus: CpuSet,
    /// Debugged thread count per host process.
    pub(crate) processes: BTreeMap<u32, u32>,
    pub(crate) debugged_cpus: CpuSet,
    /// Pre-reserved work list for wallclock adjustments.
    pub(crate) scratch: Vec<TimerId>,
    /// Timer whose handler is running, if any.
    pub(crate) firing: Option<TimerId>,
}

impl CoreState {
    fn new(online: CpuSet, rt_cpus: CpuSet, config: &CoreConfig) -> Result<Self> {
        let nr_slots = online.last().map_or(1, |cpu| cpu + 1);
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(config.timer_queue_capacity)
            .map_err(|_| CoreError::OutOfMemory)?;
        Ok(Self {
            clocks: BTreeMap::new(),
            next_clock: 0,
            timers: BTreeMap::new(),
            next_timer: 1,
            threads: BTreeMap::new(),
            next_thread: 1,
            intrs: BTreeMap::new(),
            next_intr: 1,
            lines: BTreeMap::new(),
            scheds: (0..nr_slots).map(Sched::new).collect(),
            online,
            rt_cpus,
            processes: BTreeMap::new(),
            debugged_cpus: CpuSet::empty(),
            scratch,
            firing: None,
        })
    }

    pub(crate) fn nr_slots(&self) -> usize {
        self.scheds.len()
    }
}

/// The nucleus lock, held.
///
/// Every method runs in bounded time and may be called from timer
/// handlers, interrupt service routines or host event hooks.
pub struct Locked<'a> {
    pub(crate) st: &'a mut CoreState,
    pub(crate) pipe: &'a dyn Pipeline,
    pub(crate) cfg: &'a CoreConfig,
    pub(crate) trace: Option<&'a TraceHook>,
    pub(crate) inband: &'a InbandWork,
    pub(crate) wake_sirq: SirqId,
}

impl Locked<'_> {
    pub fn current_cpu(&self) -> usize {
        self.pipe.current_cpu()
    }

    pub fn rt_cpus(&self) -> CpuSet {
        self.st.rt_cpus
    }

    pub fn online_cpus(&self) -> CpuSet {
        self.st.online
    }

    pub fn pipeline(&self) -> &dyn Pipeline {
        self.pipe
    }

    pub fn config(&self) -> &CoreConfig {
        self.cfg
    }
}

pub struct CoreBuilder<P: Pipeline> {
    pipeline: P,
    config: CoreConfig,
    trace: Option<TraceHook>,
}

impl<P: Pipeline> CoreBuilder<P> {
    pub fn new(pipeline: P) -> Self {
        Self {
            pipeline,
            config: CoreConfig::default(),
            trace: None,
        }
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Brings the nucleus up. Any failure undoes the steps already taken.
    pub fn build(self) -> Result<RealtimeCore<P>> {
        let CoreBuilder {
            pipeline,
            config,
            trace,
        } = self;

        let online = pipeline.online_cpus();
        let rt_cpus = config.rt_cpus.unwrap_or(online).and(online);
        if rt_cpus.is_empty() {
            return Err(CoreError::InvalidArgument("no real-time CPU online"));
        }

        let inband = Arc::new(InbandWork::with_capacity(config.timer_queue_capacity));
        let mut state = CoreState::new(online, rt_cpus, &config)?;

        let mut guard = Bringup::new(&pipeline);
        pipeline.enable_oob_stage()?;
        guard.oob_stage = true;
        let timer_ipi = pipeline.request_timer_ipi()?;
        guard.timer_ipi = true;
        let resched_ipi = pipeline.request_resched_ipi()?;
        guard.resched_ipi = true;
        let work = Arc::clone(&inband);
        let wake_sirq = pipeline.create_inband_sirq(Box::new(move || work.flush()))?;
        guard.sirq = Some(wake_sirq);
        pipeline.attach_kevents()?;
        guard.kevents = true;

        let core_clock = Clock::new(
            config.core_clock_name.clone(),
            ClockId::CORE,
            ClockSource::Core,
            pipeline.cycle_frequency(),
            CpuSet::empty(),
            state.nr_slots(),
            &config,
        )?;
        state.clocks.insert(ClockId::CORE, core_clock);

        for cpu in rt_cpus.iter() {
            let htimer = state.create_timer(
                ClockId::CORE,
                make_name("[host-timer]"),
                GravityTier::Irq,
                TimerAction::HostTick(cpu),
                cpu,
            )?;
            let wdtimer = state.create_timer(
                ClockId::CORE,
                make_name("[watchdog]"),
                GravityTier::Irq,
                TimerAction::Watchdog(cpu),
                cpu,
            )?;
            let sched = &mut state.scheds[cpu];
            sched.htimer = Some(htimer);
            sched.wdtimer = Some(wdtimer);
        }

        for cpu in rt_cpus.iter() {
            pipeline.request_timer(cpu)?;
            guard.timers.insert(cpu);
        }

        // From here on the core's own teardown owns every resource.
        guard.disarm();
        drop(guard);

        let core = RealtimeCore {
            pipeline,
            config,
            state: Mutex::new(state),
            trace,
            inband,
            timer_ipi,
            resched_ipi,
            wake_sirq,
            live: true,
        };
        core.atomic(|nk| -> Result<()> {
            nk.init_wallclock(ClockId::CORE)?;
            if nk.cfg.watchdog_timeout.is_some() {
                for cpu in rt_cpus.iter() {
                    nk.start_watchdog(cpu)?;
                }
            }
            Ok(())
        })?;

        log::info!(
            "nucleus up on {} ({} rt CPUs, {} Hz core clock)",
            core.pipeline.name(),
            rt_cpus.count(),
            core.pipeline.cycle_frequency()
        );
        Ok(core)
    }
}

/// Undoes a partial bring-up on early return.
struct Bringup<'a, P: Pipeline> {
    pipe: &'a P,
    oob_stage: bool,
    timer_ipi: bool,
    resched_ipi: bool,
    sirq: Option<SirqId>,
    kevents: bool,
    timers: CpuSet,
    armed: bool,
}

impl<'a, P: Pipeline> Bringup<'a, P> {
    fn new(pipe: &'a P) -> Self {
        Self {
            pipe,
            oob_stage: false,
            timer_ipi: false,
            resched_ipi: false,
            sirq: None,
            kevents: false,
            timers: CpuSet::empty(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<P: Pipeline> Drop for Bringup<'_, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for cpu in self.timers.iter() {
            self.pipe.free_timer(cpu);
        }
        if self.kevents {
            self.pipe.detach_kevents();
        }
        if let Some(sirq) = self.sirq {
            self.pipe.delete_inband_sirq(sirq);
        }
        if self.resched_ipi {
            self.pipe.free_resched_ipi();
        }
        if self.timer_ipi {
            self.pipe.free_timer_ipi();
        }
        if self.oob_stage {
            self.pipe.disable_oob_stage();
        }
        log::warn!("nucleus bring-up failed on {}", self.pipe.name());
    }
}

pub struct RealtimeCore<P: Pipeline> {
    pub(crate) pipeline: P,
    pub(crate) config: CoreConfig,
    pub(crate) state: Mutex<CoreState>,
    pub(crate) trace: Option<TraceHook>,
    pub(crate) inband: Arc<InbandWork>,
    pub(crate) timer_ipi: u32,
    pub(crate) resched_ipi: u32,
    pub(crate) wake_sirq: SirqId,
    live: bool,
}

impl<P: Pipeline> RealtimeCore<P> {
    pub fn builder(pipeline: P) -> CoreBuilder<P> {
        CoreBuilder::new(pipeline)
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn trace_hook(&self) -> Option<TraceHook> {
        self.trace.clone()
    }

    pub fn rt_cpus(&self) -> CpuSet {
        self.state.lock().rt_cpus
    }

    pub fn core_clock(&self) -> ClockId {
        ClockId::CORE
    }

    /// IRQ numbers of the timer and reschedule IPIs.
    pub fn ipi_irqs(&self) -> (u32, u32) {
        (self.timer_ipi, self.resched_ipi)
    }

    /// Runs `f` with the nucleus lock held.
    pub fn atomic<R>(&self, f: impl FnOnce(&mut Locked<'_>) -> R) -> R {
        let mut state = self.state.lock();
        let mut nk = Locked {
            st: &mut state,
            pipe: &self.pipeline,
            cfg: &self.config,
            trace: self.trace.as_ref(),
            inband: &self.inband,
            wake_sirq: self.wake_sirq,
        };
        f(&mut nk)
    }

    /// Host wake-ups delivered to the in-band stage since the last call.
    pub fn take_host_wakeups(&self) -> Vec<HostWake> {
        self.inband.take_delivered()
    }

    /// Entry point for every out-of-band interrupt the pipeline delivers.
    pub fn handle_irq(&self, irq: u32) {
        let timer_irq = self.pipeline.timer_irq();
        self.atomic(|nk| {
            if irq == timer_irq {
                nk.handle_core_tick();
            } else if irq == self.timer_ipi {
                nk.handle_timer_ipi();
            } else if irq == self.resched_ipi {
                nk.handle_resched_ipi();
            } else {
                nk.dispatch_irq(irq);
            }
        });
    }

    /// Tears the nucleus down, releasing every pipeline resource.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;

        let (lines, rt_cpus) = {
            let mut state = self.state.lock();
            for timer in state.timers.values_mut() {
                timer.status.running = false;
            }
            for clock in state.clocks.values_mut() {
                clock.clear_queues();
            }
            let lines: Vec<u32> = state.lines.keys().copied().collect();
            state.lines.clear();
            (lines, state.rt_cpus)
        };

        for irq in lines {
            self.pipeline.set_irq_affinity(irq, None).ok();
            self.pipeline.free_irq(irq);
        }
        for cpu in rt_cpus.iter() {
            self.pipeline.free_timer(cpu);
        }
        self.pipeline.detach_kevents();
        self.pipeline.delete_inband_sirq(self.wake_sirq);
        self.pipeline.free_resched_ipi();
        self.pipeline.free_timer_ipi();
        self.pipeline.disable_oob_stage();
        log::info!("nucleus down on {}", self.pipeline.name());
    }
}

impl<P: Pipeline> Drop for RealtimeCore<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Watchdog period.
pub(crate) const WATCHDOG_PERIOD_NS: u64 = NSEC_PER_SEC;

impl Locked<'_> {
    fn start_watchdog(&mut self, cpu: usize) -> Result<()> {
        let Some(wdtimer) = self.st.scheds.get(cpu).and_then(|s| s.wdtimer) else {
            return Ok(());
        };
        self.timer_start(
            wdtimer,
            WATCHDOG_PERIOD_NS,
            Some(WATCHDOG_PERIOD_NS),
            TimerMode::Relative,
        )
    }
}
