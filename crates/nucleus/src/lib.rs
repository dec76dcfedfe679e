//! # nucleus
//!
//! Scheduling and timing nucleus of a dual-kernel real-time co-kernel.
//!
//! Selected threads run on an out-of-band stage ("primary" mode) with
//! deterministic latency, and drop back to the host kernel ("secondary"
//! mode) whenever they need host services. This crate holds the parts that
//! make that work: clocks and their per-CPU timer queues, the timer engine,
//! interrupt dispatch, and the state machine moving threads between the two
//! stages. It talks to hardware only through an [`nkpipe::Pipeline`].
//!
//! ## Module Overview
//! - [`kernel`]     – [`RealtimeCore`], the global lock and the [`Locked`] context.
//! - [`clock`]      – clock registration, ticks, wallclock offsets, gravity.
//! - [`timer`]      – arm/disarm/query/migrate, overrun accounting.
//! - [`tqueue`]     – ordered timer queues (list or tree flavour).
//! - [`intr`]       – interrupt objects and the dispatch path.
//! - [`sched`]      – per-CPU slots, host tick relay, watchdog.
//! - [`thread`]     – thread execution contexts.
//! - [`modeswitch`] – harden/relax/kick and host kernel event handling.
//! - [`arch`]       – register maps and context switch.
//! - [`vfile`]      – introspection entries.
//!
//! Operations reachable through [`Locked`] run with the nucleus lock held
//! and never block. Registration lives on [`RealtimeCore`] itself.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
pub mod arith;
pub mod clock;
pub mod config;
pub mod error;
pub mod intr;
pub mod kernel;
pub mod modeswitch;
pub mod sched;
mod sync;
pub mod thread;
pub mod timer;
pub mod tqueue;
mod trace;
pub mod vfile;

pub use crate::arch::{Arch, ArchContext};
pub use crate::clock::{ClockDevice, ClockId, Gravity};
pub use crate::config::{CoreConfig, CoreConfigBuilder, LatencyTable};
pub use crate::kernel::{CoreBuilder, Locked, RealtimeCore};
pub use crate::error::{CoreError, Result};
pub use crate::intr::{IntrFlags, IntrId, IrqReturn, IrqStat, Isr};
pub use crate::modeswitch::{SyscallMode, Trap, TrapKind};
pub use crate::thread::{
    ExecMode, HostWake, PeriodWait, RelaxReason, SigSet, ThreadId, ThreadSpec, ThreadView,
};
pub use crate::timer::{
    GravityTier, TimerHandler, TimerId, TimerMode, TimerStats, TimerStatus,
};
pub use crate::trace::{TraceError, TraceHook};
pub use crate::vfile::parse_gravity;
pub use nkpipe::{CpuSet, Pipeline, PipelineError};

/// Fixed-capacity object name.
pub type Name = heapless::String<32>;

/// Builds a [`Name`], truncating `s` on a character boundary if needed.
pub fn make_name(s: &str) -> Name {
    let mut name = Name::new();
    for ch in s.chars() {
        if name.push(ch).is_err() {
            break;
        }
    }
    name
}

#[cfg(all(test, feature = "std"))]
mod tests;
