//! # nkpipe
//!
//! Interrupt pipeline abstraction used by the real-time nucleus.
//!
//! A dual-kernel system splits interrupt delivery into two stages: the
//! out-of-band stage owned by the real-time core and the in-band stage owned
//! by the host kernel. Two low-level strategies exist for that split: the
//! legacy interrupt virtualization layer ([`ipipe`]) and the interrupt
//! staging layer ([`dovetail`]). Both implement [`Pipeline`] so the nucleus
//! never needs to know which one it runs on.
//!
//! ## Module Overview
//! - [`CpuSet`]     – fixed-width CPU mask used across the interface.
//! - [`Pipeline`]   – the backend contract.
//! - [`sim`]        – simulated hardware shared by both backends (`std`).
//! - [`ipipe`]      – virtual-IRQ based backend (`std`).
//! - [`dovetail`]   – out-of-band IPI and proxy-tick backend (`std`).

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

use alloc::boxed::Box;

mod cpuset;
mod error;

#[cfg(feature = "std")]
pub mod dovetail;
#[cfg(feature = "std")]
pub mod ipipe;
#[cfg(feature = "std")]
pub mod sim;

pub use cpuset::CpuSet;
pub use error::PipelineError;

/// Handler run from the in-band stage when a soft IRQ is posted.
pub type SirqHandler = Box<dyn Fn() + Send + Sync>;

/// Identifier of an in-band soft IRQ created through
/// [`Pipeline::create_inband_sirq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SirqId(pub u32);

/// Contract between the nucleus and an interrupt pipeline backend.
///
/// Request/free methods are only called from registration paths where
/// blocking is legal. Everything else may be called with the nucleus lock
/// held and must return in bounded time.
pub trait Pipeline: Send + Sync {
    /// Short backend name, used in diagnostics.
    fn name(&self) -> &'static str;

    fn enable_oob_stage(&self) -> Result<(), PipelineError>;
    fn disable_oob_stage(&self);

    fn online_cpus(&self) -> CpuSet;
    fn current_cpu(&self) -> usize;

    /// Number of hardware IRQ lines addressable through [`Pipeline::request_irq`].
    fn nr_irqs(&self) -> u32;

    /// Free-running, monotonic hardware time source.
    fn read_cycle_counter(&self) -> u64;
    /// Frequency of the cycle counter in Hz.
    fn cycle_frequency(&self) -> u64;

    /// Host wall clock, nanoseconds since the epoch.
    fn read_wallclock(&self) -> u64;
    /// Writes the host wall clock back. Not every backend can do this.
    fn set_wallclock(&self, epoch_ns: u64) -> Result<(), PipelineError>;

    /// Grabs the per-CPU hardware timer for out-of-band use.
    fn request_timer(&self, cpu: usize) -> Result<(), PipelineError>;
    fn free_timer(&self, cpu: usize);
    /// IRQ number the hardware timer ticks on.
    fn timer_irq(&self) -> u32;
    /// Programs the next one-shot event of the current CPU's timer, `delay`
    /// cycles from now.
    fn set_timer_shot(&self, delay: u64);

    fn request_timer_ipi(&self) -> Result<u32, PipelineError>;
    fn free_timer_ipi(&self);
    fn send_timer_ipi(&self, cpus: CpuSet);

    fn request_resched_ipi(&self) -> Result<u32, PipelineError>;
    fn free_resched_ipi(&self);
    fn send_resched_ipi(&self, cpus: CpuSet);

    fn create_inband_sirq(&self, handler: SirqHandler) -> Result<SirqId, PipelineError>;
    fn delete_inband_sirq(&self, sirq: SirqId);
    fn post_inband_sirq(&self, sirq: SirqId);

    /// Hooks process-level kernel events (signals, exits, migrations).
    fn attach_kevents(&self) -> Result<(), PipelineError>;
    fn detach_kevents(&self);

    /// Installs `irq` with out-of-band delivery on `cpus`.
    fn request_irq(&self, irq: u32, cpus: CpuSet) -> Result<(), PipelineError>;
    fn free_irq(&self, irq: u32);
    /// Sets or clears (`None`) the affinity hint of `irq`.
    fn set_irq_affinity(&self, irq: u32, cpus: Option<CpuSet>) -> Result<(), PipelineError>;
    fn enable_irq(&self, irq: u32);
    fn disable_irq(&self, irq: u32);
    fn end_irq(&self, irq: u32);
    /// Hands `irq` over to the in-band stage.
    fn propagate_irq(&self, irq: u32);
    /// Relays a pending host tick to the in-band stage of `cpu`.
    fn propagate_host_tick(&self, cpu: usize);

    /// Moves the calling task from the in-band to the out-of-band stage.
    fn leave_inband(&self) -> Result<(), PipelineError>;
    /// Moves the calling task back to the in-band stage.
    fn leave_oob(&self);
    /// Forces the task identified by `pid` through the mayday trap on its
    /// next return to user space.
    fn raise_mayday(&self, pid: u32);
}
