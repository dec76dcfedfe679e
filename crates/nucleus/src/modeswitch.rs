//! Primary/secondary mode switching.
//!
//! A thread hardens to run on the out-of-band stage and relaxes to get
//! host services back. Both transitions go through a transient state that
//! never outlives one locked section. This module also reacts to the host
//! kernel events that force a transition: signals, debugger stops and
//! resumes, affinity changes, CPU migrations and task exit.

use nkpipe::CpuSet;

use crate::arch::ArchContext;
use crate::error::{CoreError, Result};
use crate::kernel::Locked;
use crate::thread::{Block, ExecMode, HostWake, RelaxReason, SigSet, ThreadId};
use crate::trace::{emit, records};

/// Stage a system call must run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallMode {
    /// Out-of-band only; the caller hardens first.
    Primary,
    /// Host kernel only; the caller relaxes first.
    Secondary,
    /// Whatever stage the caller is on.
    Current,
    /// The caller's natural stage, primary for real-time threads.
    Conforming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    PageFault,
    /// Handled in place by the out-of-band stage.
    Fpu,
    Breakpoint,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub kind: TrapKind,
}

impl Trap {
    pub const fn new(kind: TrapKind) -> Self {
        Self { kind }
    }
}

impl Locked<'_> {
    /// Moves a primary thread to secondary mode. With `notify`, a thread
    /// asking for warnings gets the diagnostic signal carrying `reason`.
    /// Relaxing a thread already relaxed is a no-op.
    pub fn relax(&mut self, tid: ThreadId, notify: bool, reason: RelaxReason) -> Result<()> {
        let debugged = {
            let thread = self.thread_ref(tid)?;
            if thread.mode != ExecMode::Primary {
                return Ok(());
            }
            self.st
                .processes
                .get(&thread.host.process)
                .is_some_and(|n| *n > 0)
        };

        let thread = self.st.threads.get_mut(&tid).ok_or(CoreError::NotFound)?;
        thread.mode = ExecMode::Relaxing;
        emit(self.trace, records::shadow::GORELAX, false, |p| {
            p.u32(tid.0).u16(reason.code() as u16);
        });

        let (cpu, pid) = (thread.cpu, thread.host.pid);
        thread.last_relax = Some(reason);
        thread.stats.ssw += 1;
        thread.info.kicked = false;
        thread.host.nowakeup = false;
        // Threads of a debugged process stop again once back in primary mode.
        if debugged && !thread.state.sstep {
            thread.blocks.dbgstop = true;
        }
        if notify && thread.state.warn {
            thread.host.signals.add(SigSet::SIGDEBUG);
            thread.host.sigdebug = Some(reason);
        }
        thread.mode = ExecMode::Relaxed;

        self.inband.queue(HostWake {
            thread: tid,
            pid,
            reason,
        });
        self.pipe.post_inband_sirq(self.wake_sirq);
        self.pipe.leave_oob();

        self.set_resched(cpu);
        self.sched_run();
        emit(self.trace, records::shadow::RELAXED, false, |p| {
            p.u32(tid.0);
        });
        log::debug!("thread #{} relaxed ({})", tid.0, reason.label());
        Ok(())
    }

    /// Moves a relaxed thread to primary mode.
    ///
    /// Fails with [`CoreError::RestartSyscall`] when host signals are
    /// pending, and with [`CoreError::Canceled`] when the host runs the
    /// thread on a CPU outside the real-time set.
    pub fn harden(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.st.threads.get_mut(&tid).ok_or(CoreError::NotPermitted)?;
        match thread.mode {
            ExecMode::Primary => return Ok(()),
            ExecMode::Terminated => return Err(CoreError::NotPermitted),
            _ => {}
        }
        if !thread.host.signals.is_empty() {
            return Err(CoreError::RestartSyscall);
        }
        thread.mode = ExecMode::Hardening;
        emit(self.trace, records::shadow::GOHARD, false, |p| {
            p.u32(tid.0);
        });

        if let Err(err) = self.pipe.leave_inband() {
            self.thread_mut(tid)?.mode = ExecMode::Relaxed;
            return Err(err.into());
        }
        // A signal may have slipped in during the migration.
        if !self.thread_ref(tid)?.host.signals.is_empty() {
            self.thread_mut(tid)?.mode = ExecMode::Relaxed;
            self.pipe.leave_oob();
            return Err(CoreError::RestartSyscall);
        }
        if let Err(err) = self.check_affinity(tid) {
            self.thread_mut(tid)?.mode = ExecMode::Relaxed;
            self.pipe.leave_oob();
            return Err(err);
        }

        let thread = self.thread_mut(tid)?;
        thread.mode = ExecMode::Primary;
        thread.info.kicked = false;
        thread.info.harden_pending = false;
        let cpu = thread.cpu;
        self.set_resched(cpu);
        self.sched_run();
        emit(self.trace, records::shadow::HARDENED, false, |p| {
            p.u32(tid.0).u16(cpu as u16);
        });
        Ok(())
    }

    /// Follows the host CPU of a hardening thread. A non real-time CPU
    /// cancels the thread; another real-time CPU moves it there.
    fn check_affinity(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_ref(tid)?;
        let (host_cpu, cpu) = (thread.host.cpu, thread.cpu);
        if !self.st.rt_cpus.contains(host_cpu) {
            let thread = self.thread_mut(tid)?;
            thread.info.canceled = true;
            log::warn!(
                "thread {} switched to non real-time CPU {host_cpu}, canceled",
                thread.name
            );
            return Err(CoreError::Canceled);
        }
        if host_cpu != cpu {
            self.migrate_thread(tid, host_cpu)?;
        }
        Ok(())
    }

    /// Rebinds a thread and its timers to `cpu`.
    pub(crate) fn migrate_thread(&mut self, tid: ThreadId, cpu: usize) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        thread.cpu = cpu;
        thread.info.moved = true;
        let (rtimer, ptimer) = (thread.rtimer, thread.ptimer);
        self.timer_migrate(rtimer, cpu)?;
        self.timer_migrate(ptimer, cpu)
    }

    /// Forces a primary thread out of its current wait so it relaxes at
    /// the next opportunity. Remote or sleeping user threads get a mayday.
    pub fn kick(&mut self, tid: ThreadId) {
        let Ok(thread) = self.thread_mut(tid) else {
            return;
        };
        if thread.mode != ExecMode::Primary {
            return;
        }
        thread.info.kicked = true;
        let (cpu, user, pid, suspended) = (
            thread.cpu,
            thread.state.user,
            thread.host.pid,
            thread.blocks.suspended,
        );

        let _ = self.unblock(tid);
        if suspended {
            let _ = self.unblock_cond(tid, Block::Suspended);
        }
        if user && !(self.is_current(tid) && cpu == self.pipe.current_cpu()) {
            if let Ok(thread) = self.thread_mut(tid) {
                if thread.pending_mayday.is_none() {
                    thread.pending_mayday = Some(RelaxReason::Signal);
                }
            }
            self.pipe.raise_mayday(pid);
        }
        self.set_resched(cpu);
        emit(self.trace, records::shadow::KICK, false, |p| {
            p.u32(tid.0);
        });
    }

    /// Host signal `sig` sent to `tid`.
    pub fn handle_sigwake(&mut self, tid: ThreadId, sig: u32) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        thread.host.signals.add(sig);
        let traced_stop = thread.host.ptraced && thread.host.signals.stop_pending();
        if traced_stop {
            self.register_debugged(tid)?;
        }

        let thread = self.thread_mut(tid)?;
        if thread.mode != ExecMode::Primary {
            return Ok(());
        }
        // The host must not run the task before it relaxes.
        if thread.host.sleeping {
            thread.host.nowakeup = true;
        }
        self.kick(tid);
        self.sched_run();
        Ok(())
    }

    /// Starts debugging `tid`. The first debugged thread of a process
    /// stops every other primary thread of it.
    pub fn register_debugged(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        if thread.state.sstep {
            return Ok(());
        }
        thread.state.sstep = true;
        if thread.mode == ExecMode::Primary {
            thread.info.conthi = true;
        }
        let (process, host_cpu) = (thread.host.process, thread.host.cpu);
        self.st.debugged_cpus.insert(host_cpu);

        let count = self.st.processes.entry(process).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(());
        }
        let mut cpus = CpuSet::empty();
        for (id, other) in self.st.threads.iter_mut() {
            if *id != tid
                && other.host.process == process
                && other.mode == ExecMode::Primary
                && !other.state.sstep
            {
                other.blocks.dbgstop = true;
                cpus.insert(other.cpu);
            }
        }
        for cpu in cpus.iter() {
            self.set_resched(cpu);
        }
        log::debug!("process {process} under debug");
        Ok(())
    }

    /// Ends debugging of `tid`. Once the last debugged thread of the
    /// process lets go, every stopped thread resumes with its overruns
    /// hidden once. A thread kicked out of primary mode by the debugger
    /// hardens again on its next return to user space.
    pub fn unregister_debugged(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        if !thread.state.sstep {
            return Ok(());
        }
        thread.state.sstep = false;
        thread.info.hiccup = true;
        if thread.info.conthi {
            thread.info.conthi = false;
            thread.info.harden_pending = true;
        }
        let (process, host_cpu) = (thread.host.process, thread.host.cpu);

        if !self
            .st
            .threads
            .values()
            .any(|t| t.state.sstep && t.host.cpu == host_cpu)
        {
            self.st.debugged_cpus.remove(host_cpu);
        }

        let remaining = match self.st.processes.get_mut(&process) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(());
        }
        self.st.processes.remove(&process);

        let mut cpus = CpuSet::empty();
        for other in self.st.threads.values_mut() {
            if other.host.process == process && other.blocks.dbgstop {
                other.blocks.dbgstop = false;
                other.info.hiccup = true;
                cpus.insert(other.cpu);
            }
        }
        for cpu in cpus.iter() {
            self.set_resched(cpu);
        }
        log::debug!("process {process} released by debugger");
        Ok(())
    }

    /// The debugger resumed `tid`; single-stepping keeps it registered.
    pub fn handle_ptrace_resume(&mut self, tid: ThreadId, singlestep: bool) -> Result<()> {
        if singlestep {
            self.thread_ref(tid)?;
            return Ok(());
        }
        self.unregister_debugged(tid)
    }

    /// The host scheduled `tid` in. A debugged thread with no stop signal
    /// left is done with the debugger.
    pub fn handle_schedule_in(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_ref(tid)?;
        if thread.state.sstep && !thread.host.signals.stop_pending() {
            self.unregister_debugged(tid)?;
        }
        Ok(())
    }

    /// The host changed the CPU affinity of `tid`.
    pub fn handle_setaffinity(&mut self, tid: ThreadId, cpus: CpuSet) -> Result<()> {
        let rt_cpus = self.st.rt_cpus;
        let thread = self.thread_mut(tid)?;
        let affinity = cpus.and(rt_cpus);
        thread.affinity = affinity;
        if affinity.is_empty() {
            log::warn!("thread {} has no real-time CPU left", thread.name);
            return Ok(());
        }
        let cpu = thread.cpu;
        let relaxed = thread.mode == ExecMode::Relaxed;
        match affinity.first() {
            Some(target) if relaxed && !affinity.contains(cpu) => self.migrate_thread(tid, target),
            _ => Ok(()),
        }
    }

    /// The host moved `tid` to `cpu`. Only relaxed threads may move; a
    /// primary thread moved behind the nucleus' back is kicked out.
    pub fn host_migrate(&mut self, tid: ThreadId, cpu: usize) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        thread.host.cpu = cpu;
        if thread.mode == ExecMode::Primary {
            log::warn!("thread {} migrated by the host in primary mode", thread.name);
            self.kick(tid);
        }
        Ok(())
    }

    /// The host task backing `tid` exited. The slot lingers as a zombie
    /// while its CPU still runs it.
    pub fn handle_task_exit(&mut self, tid: ThreadId) -> Result<()> {
        if self.thread_ref(tid)?.state.sstep {
            self.unregister_debugged(tid)?;
        }
        let thread = self.thread_mut(tid)?;
        let (rtimer, ptimer, cpu) = (thread.rtimer, thread.ptimer, thread.cpu);
        thread.mode = ExecMode::Terminated;
        thread.blocks = Default::default();
        thread.u_window = None;
        thread.pending_mayday = None;
        let name = thread.name.clone();

        self.timer_destroy(rtimer)?;
        self.timer_destroy(ptimer)?;

        let current = self.st.scheds.get(cpu).is_some_and(|s| s.curr == Some(tid));
        if current {
            if let Some(sched) = self.st.scheds.get_mut(cpu) {
                sched.zombie = Some(tid);
            }
            self.set_resched(cpu);
        } else {
            self.st.threads.remove(&tid);
        }
        emit(self.trace, records::shadow::UNMAP, false, |p| {
            p.u32(tid.0);
        });
        log::debug!("thread {name} unmapped");
        Ok(())
    }

    /// Trap taken by `tid`. Returns whether the host has to handle it,
    /// in which case the thread is now relaxed.
    pub fn handle_trap(&mut self, tid: ThreadId, trap: Trap) -> Result<bool> {
        let thread = self.thread_mut(tid)?;
        if trap.kind == TrapKind::PageFault {
            thread.stats.pf += 1;
        }
        if thread.mode != ExecMode::Primary || trap.kind == TrapKind::Fpu {
            return Ok(false);
        }
        if thread.state.user {
            self.relax(tid, true, RelaxReason::Fault)?;
        } else {
            log::warn!("{:?} in kernel thread {}, switching to secondary mode", trap.kind, thread.name);
            self.relax(tid, false, RelaxReason::Fault)?;
        }
        Ok(true)
    }

    /// Syscall prologue: moves `tid` to the stage the call needs. Returns
    /// the mode the call runs in.
    pub fn syscall_entry(&mut self, tid: ThreadId, mode: SyscallMode) -> Result<ExecMode> {
        let thread = self.thread_mut(tid)?;
        thread.stats.xsc += 1;
        let current = thread.mode;
        match mode {
            SyscallMode::Current => {}
            SyscallMode::Primary | SyscallMode::Conforming => {
                if current != ExecMode::Primary {
                    self.harden(tid)?;
                }
            }
            SyscallMode::Secondary => {
                if current == ExecMode::Primary {
                    self.relax(tid, true, RelaxReason::Syscall)?;
                }
            }
        }
        self.thread_mode(tid)
    }

    /// Syscall epilogue: stores the result in the return register of the
    /// configured ABI. A kicked thread relaxes so the host can deliver its
    /// signals; a call interrupted that way is marked for restart.
    pub fn syscall_return(&mut self, tid: ThreadId, result: Result<u64>) -> Result<()> {
        let map = self.cfg.arch.abi();
        let thread = self.thread_mut(tid)?;
        let mut result = result;
        let mut notify = false;
        let kicked = thread.info.kicked;
        if kicked {
            if !thread.host.signals.is_empty() {
                result = Err(CoreError::RestartSyscall);
                thread.info.sysrst = true;
                thread.info.broken = false;
                notify = !thread.state.sstep;
            }
            thread.info.kicked = false;
        }
        let primary = thread.mode == ExecMode::Primary;
        self.context_mut(tid)?
            .set_result(map, result.map_err(|e| e.errno()));
        if kicked && primary {
            self.relax(tid, notify, RelaxReason::Signal)?;
        }
        Ok(())
    }

    /// Return to user space. Consumes a pending harden request.
    pub fn return_to_user(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        if !thread.info.harden_pending || thread.mode != ExecMode::Relaxed {
            return Ok(());
        }
        thread.info.harden_pending = false;
        self.harden(tid)
    }

    /// Requests `tid` to harden on its next return to user space.
    pub fn harden_deferred(&mut self, tid: ThreadId) -> Result<()> {
        self.thread_mut(tid)?.info.harden_pending = true;
        Ok(())
    }

    /// Mayday trap taken by `tid` on its way back to user space.
    pub fn handle_mayday(&mut self, tid: ThreadId) -> Result<()> {
        let thread = self.thread_mut(tid)?;
        let reason = thread.pending_mayday.take();
        let due = thread.mode == ExecMode::Primary && (thread.info.kicked || reason.is_some());
        emit(self.trace, records::shadow::MAYDAY, false, |p| {
            p.u32(tid.0);
        });
        if due {
            self.relax(tid, false, reason.unwrap_or(RelaxReason::Signal))?;
        }
        Ok(())
    }

    /// Register context of `tid`: the live one of its CPU while it runs
    /// there, the saved one otherwise.
    pub fn thread_context(&self, tid: ThreadId) -> Result<ArchContext> {
        let thread = self.thread_ref(tid)?;
        match self.st.scheds.get(thread.cpu) {
            Some(sched) if sched.curr == Some(tid) => Ok(sched.live),
            _ => Ok(thread.ctx),
        }
    }

    pub fn thread_context_mut(&mut self, tid: ThreadId) -> Result<&mut ArchContext> {
        self.context_mut(tid)
    }

    fn context_mut(&mut self, tid: ThreadId) -> Result<&mut ArchContext> {
        let cpu = self.thread_ref(tid)?.cpu;
        let st = &mut *self.st;
        match st.scheds.get_mut(cpu) {
            Some(sched) if sched.curr == Some(tid) => Ok(&mut sched.live),
            _ => st
                .threads
                .get_mut(&tid)
                .map(|t| &mut t.ctx)
                .ok_or(CoreError::NotFound),
        }
    }
}
