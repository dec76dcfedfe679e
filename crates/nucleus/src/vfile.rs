//! Introspection entries.
//!
//! Text snapshots of the nucleus state, laid out the way the host exposes
//! them under its proc-like tree:
//!
//! - `clock/<name>`: gravity, devices and raw ticks. Writable with gravity
//!   tokens, see [`parse_gravity`].
//! - `timer/<clock>`: timers queued on a clock.
//! - `irq`: per-CPU hit counts of every out-of-band line.
//! - `sched/threads`: threads known to the nucleus.
//!
//! Records are collected under the lock and formatted after releasing it.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use nkpipe::{CpuSet, Pipeline};

use crate::arith::format_duration;
use crate::clock::{Clock, ClockId, Gravity};
use crate::error::{CoreError, Result};
use crate::kernel::RealtimeCore;
use crate::thread::{ExecMode, RelaxReason};
use crate::timer::TimerStatus;
use crate::Name;

/// Token separators accepted by [`parse_gravity`].
const SEPARATORS: &[char] = &[' ', '\t', ':', '/', ','];

/// Parses gravity tokens `<ns>[i|k|u]` on top of `current`. A token
/// without suffix sets the user tier.
pub fn parse_gravity(input: &str, current: Gravity) -> Result<Gravity> {
    let mut gravity = current;
    let mut seen = false;
    for token in input.split(SEPARATORS).filter(|t| !t.is_empty()) {
        let split = token
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(token.len());
        let (digits, suffix) = token.split_at(split);
        let ns: u64 = digits
            .parse()
            .map_err(|_| CoreError::InvalidArgument("gravity value"))?;
        match suffix {
            "i" => gravity.irq = ns,
            "k" => gravity.kernel = ns,
            "u" | "" => gravity.user = ns,
            _ => return Err(CoreError::InvalidArgument("gravity tier")),
        }
        seen = true;
    }
    if !seen {
        return Err(CoreError::InvalidArgument("gravity"));
    }
    Ok(gravity)
}

struct ClockRecord {
    gravity: Gravity,
    timer_dev: Name,
    clock_dev: Name,
    ticks: u64,
}

struct TimerRecord {
    cpu: usize,
    scheduled: u64,
    fired: u64,
    timeout: Option<u64>,
    interval: Option<u64>,
    status: TimerStatus,
    name: Name,
}

struct IrqRecord {
    irq: u32,
    hits: Vec<u64>,
    name: Name,
}

struct ThreadRecord {
    cpu: usize,
    pid: u32,
    priority: i32,
    mode: ExecMode,
    csw: u64,
    ssw: u64,
    last_relax: Option<RelaxReason>,
    name: Name,
}

fn mode_label(mode: ExecMode) -> &'static str {
    match mode {
        ExecMode::Primary => "primary",
        ExecMode::Relaxing => "relaxing",
        ExecMode::Relaxed => "relaxed",
        ExecMode::Hardening => "hardening",
        ExecMode::Terminated => "zombie",
    }
}

fn status_label(status: TimerStatus) -> String {
    let mut out = String::new();
    for (set, ch) in [
        (status.running, 'r'),
        (status.periodic, 'p'),
        (status.fired, 'f'),
        (status.realtime, 'w'),
        (status.killed, 'k'),
    ] {
        if set {
            out.push(ch);
        }
    }
    if out.is_empty() {
        out.push('-');
    }
    out
}

fn gravity_ns(clock: &Clock) -> Gravity {
    Gravity {
        irq: clock.scale.ticks_to_ns_rounded(clock.gravity.irq),
        kernel: clock.scale.ticks_to_ns_rounded(clock.gravity.kernel),
        user: clock.scale.ticks_to_ns_rounded(clock.gravity.user),
    }
}

fn format_clock(out: &mut String, rec: &ClockRecord) -> fmt::Result {
    writeln!(
        out,
        "{:>7}: irq={} kernel={} user={}",
        "gravity", rec.gravity.irq, rec.gravity.kernel, rec.gravity.user
    )?;
    writeln!(
        out,
        "{:>7}: timer={}, clock={}",
        "devices", rec.timer_dev, rec.clock_dev
    )?;
    writeln!(
        out,
        "{:>7}: {} ({:04x} {:08x})",
        "ticks",
        rec.ticks,
        rec.ticks >> 32,
        rec.ticks & 0xffff_ffff
    )
}

fn format_timers(out: &mut String, records: &[TimerRecord]) -> fmt::Result {
    writeln!(
        out,
        "{:<3}  {:<20}  {:<10}  {:<10}  {:<6}  NAME",
        "CPU", "SCHED/SHOT", "TIMEOUT", "INTERVAL", "STATUS"
    )?;
    for rec in records {
        let shots = alloc::format!("{}/{}", rec.scheduled, rec.fired);
        let timeout = format_duration(rec.timeout.unwrap_or(0));
        let interval = format_duration(rec.interval.unwrap_or(0));
        writeln!(
            out,
            "{:>3}  {:<20}  {:<10}  {:<10}  {:<6}  {}",
            rec.cpu,
            shots,
            timeout.as_str(),
            interval.as_str(),
            status_label(rec.status),
            rec.name
        )?;
    }
    Ok(())
}

fn format_irqs(out: &mut String, cpus: CpuSet, records: &[IrqRecord]) -> fmt::Result {
    write!(out, "  IRQ")?;
    for cpu in cpus.iter() {
        write!(out, "{:>12}", alloc::format!("CPU{cpu}"))?;
    }
    writeln!(out)?;
    for rec in records {
        write!(out, "{:>5}:", rec.irq)?;
        for hits in &rec.hits {
            write!(out, "{hits:>12}")?;
        }
        writeln!(out, "         {}", rec.name)?;
    }
    Ok(())
}

fn format_threads(out: &mut String, records: &[ThreadRecord]) -> fmt::Result {
    writeln!(
        out,
        "{:<3}  {:<6}  {:<4}  {:<9}  {:<8}  {:<8}  {:<10}  NAME",
        "CPU", "PID", "PRI", "MODE", "CSW", "SSW", "RELAX"
    )?;
    for rec in records {
        writeln!(
            out,
            "{:>3}  {:<6}  {:<4}  {:<9}  {:<8}  {:<8}  {:<10}  {}",
            rec.cpu,
            rec.pid,
            rec.priority,
            mode_label(rec.mode),
            rec.csw,
            rec.ssw,
            rec.last_relax.map_or("-", RelaxReason::label),
            rec.name
        )?;
    }
    Ok(())
}

fn finish(out: String, result: fmt::Result) -> Result<String> {
    result.map_err(|_| CoreError::OutOfMemory)?;
    Ok(out)
}

impl<P: Pipeline> RealtimeCore<P> {
    fn clock_named(&self, name: &str) -> Result<ClockId> {
        self.clock_by_name(name).ok_or(CoreError::NotFound)
    }

    pub fn read_clock_entry(&self, name: &str) -> Result<String> {
        let id = self.clock_named(name)?;
        let rec = {
            let st = self.state.lock();
            let clock = st.clocks.get(&id).ok_or(CoreError::NotFound)?;
            let timer_dev = if clock.is_core() {
                crate::make_name(self.pipeline.name())
            } else {
                crate::make_name(clock.device_name(&self.pipeline))
            };
            ClockRecord {
                gravity: gravity_ns(clock),
                timer_dev,
                clock_dev: crate::make_name(clock.device_name(&self.pipeline)),
                ticks: clock.read_raw(&self.pipeline),
            }
        };
        let mut out = String::new();
        let result = format_clock(&mut out, &rec);
        finish(out, result)
    }

    /// Applies gravity tokens written to `clock/<name>`.
    pub fn write_clock_entry(&self, name: &str, input: &str) -> Result<()> {
        let id = self.clock_named(name)?;
        self.atomic(|nk| {
            let gravity = parse_gravity(input, nk.gravity(id)?)?;
            nk.set_gravity(id, gravity)
        })
    }

    pub fn read_timer_entry(&self, clock: &str) -> Result<String> {
        let id = self.clock_named(clock)?;
        let records: Vec<TimerRecord> = {
            let st = self.state.lock();
            let clock = st.clocks.get(&id).ok_or(CoreError::NotFound)?;
            let now = clock.read_raw(&self.pipeline);
            st.timers
                .values()
                .filter(|t| t.clock == id && !t.status.killed)
                .map(|t| TimerRecord {
                    cpu: t.cpu,
                    scheduled: t.stats.scheduled,
                    fired: t.stats.fired,
                    timeout: t
                        .status
                        .running
                        .then(|| clock.scale.ticks_to_ns(t.date.saturating_sub(now)).max(1)),
                    interval: t.status.running.then_some(t.interval_ns).flatten(),
                    status: t.status,
                    name: t.name.clone(),
                })
                .collect()
        };
        let mut out = String::new();
        let result = format_timers(&mut out, &records);
        finish(out, result)
    }

    pub fn read_irq_entry(&self) -> Result<String> {
        let (cpus, records) = {
            let st = self.state.lock();
            let cpus = st.rt_cpus;
            let mut records = Vec::new();
            records.push(IrqRecord {
                irq: self.pipeline.timer_irq(),
                hits: cpus
                    .iter()
                    .map(|cpu| st.scheds.get(cpu).map_or(0, |s| s.timer_stat.hits))
                    .collect(),
                name: crate::make_name("[timer]"),
            });
            for (irq, line) in &st.lines {
                for id in line.handlers.iter() {
                    if let Some(intr) = st.intrs.get(id) {
                        records.push(IrqRecord {
                            irq: *irq,
                            hits: cpus
                                .iter()
                                .map(|cpu| intr.stats.get(cpu).map_or(0, |s| s.hits))
                                .collect(),
                            name: intr.name.clone(),
                        });
                    }
                }
            }
            (cpus, records)
        };
        let mut out = String::new();
        let result = format_irqs(&mut out, cpus, &records);
        finish(out, result)
    }

    pub fn read_threads_entry(&self) -> Result<String> {
        let records: Vec<ThreadRecord> = {
            let st = self.state.lock();
            st.threads
                .values()
                .map(|t| ThreadRecord {
                    cpu: t.cpu,
                    pid: t.host.pid,
                    priority: t.priority,
                    mode: t.mode,
                    csw: t.stats.csw,
                    ssw: t.stats.ssw,
                    last_relax: t.last_relax,
                    name: t.name.clone(),
                })
                .collect()
        };
        let mut out = String::new();
        let result = format_threads(&mut out, &records);
        finish(out, result)
    }

    /// Reads the entry at `path`.
    pub fn read_entry(&self, path: &str) -> Result<String> {
        match path.split_once('/') {
            Some(("clock", name)) => self.read_clock_entry(name),
            Some(("timer", clock)) => self.read_timer_entry(clock),
            Some(("sched", "threads")) => self.read_threads_entry(),
            None if path == "irq" => self.read_irq_entry(),
            _ => Err(CoreError::NotFound),
        }
    }

    /// Writes `input` to the entry at `path`. Only clock entries accept
    /// writes.
    pub fn write_entry(&self, path: &str, input: &str) -> Result<()> {
        match path.split_once('/') {
            Some(("clock", name)) => self.write_clock_entry(name, input),
            _ => Err(CoreError::NotPermitted),
        }
    }
}
