//! Nucleus configuration.

use nkpipe::CpuSet;

use crate::arch::Arch;
use crate::{make_name, Name};

/// Scheduling latency calibration in nanoseconds, per execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LatencyTable {
    pub irq: u64,
    pub kernel: u64,
    pub user: u64,
}

impl LatencyTable {
    /// Calibrated defaults for `arch`. A zero kernel tier means "use the
    /// user tier".
    pub const fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Self {
                irq: 1_000,
                kernel: 0,
                user: 4_000,
            },
            Arch::Aarch64 => Self {
                irq: 2_000,
                kernel: 3_000,
                user: 6_500,
            },
            Arch::Host => Self {
                irq: 0,
                kernel: 0,
                user: 0,
            },
        }
    }

    /// Applies the kernel-tier fallback.
    pub const fn resolved(self) -> Self {
        Self {
            irq: self.irq,
            kernel: if self.kernel == 0 { self.user } else { self.kernel },
            user: self.user,
        }
    }
}

/// Runtime configuration of a [`crate::RealtimeCore`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoreConfig {
    pub arch: Arch,
    /// CPUs allowed to run the real-time stage. `None` means every online
    /// CPU.
    pub rt_cpus: Option<CpuSet>,
    /// Entries reserved per timer queue at clock registration.
    pub timer_queue_capacity: usize,
    /// Overrides the architecture latency table.
    pub latencies: Option<LatencyTable>,
    /// Runaway thread watchdog, in seconds. `None` disables it.
    pub watchdog_timeout: Option<u32>,
    /// Relay the host tick through the real-time timer queue.
    pub relay_host_tick: bool,
    /// Consecutive unhandled interrupts before a line is disabled.
    pub max_unhandled_irqs: u32,
    /// Passes over an edge-triggered shared line before giving up.
    pub max_edge_irq_passes: u32,
    /// Size of the per-thread shared memory window.
    pub u_window_size: usize,
    pub core_clock_name: Name,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Host,
            rt_cpus: None,
            timer_queue_capacity: 64,
            latencies: None,
            watchdog_timeout: Some(4),
            relay_host_tick: true,
            max_unhandled_irqs: 1000,
            max_edge_irq_passes: 128,
            u_window_size: 64,
            core_clock_name: make_name("coreclk"),
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Latency table in effect, fallback applied.
    pub fn effective_latencies(&self) -> LatencyTable {
        self.latencies
            .unwrap_or_else(|| LatencyTable::for_arch(self.arch))
            .resolved()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn arch(mut self, arch: Arch) -> Self {
        self.config.arch = arch;
        self
    }

    pub fn rt_cpus(mut self, cpus: CpuSet) -> Self {
        self.config.rt_cpus = Some(cpus);
        self
    }

    pub fn timer_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.timer_queue_capacity = capacity;
        self
    }

    pub fn latencies(mut self, table: LatencyTable) -> Self {
        self.config.latencies = Some(table);
        self
    }

    pub fn watchdog_timeout(mut self, secs: Option<u32>) -> Self {
        self.config.watchdog_timeout = secs;
        self
    }

    pub fn relay_host_tick(mut self, relay: bool) -> Self {
        self.config.relay_host_tick = relay;
        self
    }

    pub fn max_unhandled_irqs(mut self, max: u32) -> Self {
        self.config.max_unhandled_irqs = max;
        self
    }

    pub fn max_edge_irq_passes(mut self, max: u32) -> Self {
        self.config.max_edge_irq_passes = max;
        self
    }

    pub fn u_window_size(mut self, size: usize) -> Self {
        self.config.u_window_size = size;
        self
    }

    pub fn core_clock_name(mut self, name: &str) -> Self {
        self.config.core_clock_name = make_name(name);
        self
    }

    pub fn build(self) -> CoreConfig {
        self.config
    }
}
