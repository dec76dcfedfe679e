//! Canonical record identifiers emitted by the nucleus.
//!
//! Payload fields are little-endian. Dates and deltas are in clock ticks
//! unless noted otherwise.

/// Timer engine records. Payloads start with the timer id (`u32`).
pub mod timer {
    /// Timer created: id, clock number (`i32`), cpu (`u16`).
    pub const INIT: u8 = 1;
    /// Timer armed: id, queue date (`u64`), interval in ns (`u64`, 0 for
    /// one-shot).
    pub const START: u8 = 2;
    pub const STOP: u8 = 3;
    /// Timer fired from a clock tick: id, queue date (`u64`).
    pub const EXPIRE: u8 = 4;
    /// Timer moved to another CPU: id, target cpu (`u16`).
    pub const MIGRATE: u8 = 5;
    pub const DESTROY: u8 = 6;
}

/// Clock engine records. Payloads start with the clock number (`i32`,
/// -1 for the core clock).
pub mod clock {
    /// Clock tick entry: clock, cpu (`u16`), now (`u64`).
    pub const TICK: u8 = 16;
    /// Shot programmed: clock, cpu (`u16`), head timer (`u32`), date (`u64`).
    pub const PROGRAM: u8 = 17;
    /// Remote shot requested: clock, cpu (`u16`).
    pub const REMOTE: u8 = 18;
    /// Wallclock offset changed: clock, delta (`i64`).
    pub const ADJUST: u8 = 19;
}

/// Interrupt dispatch records. Payloads start with the IRQ number (`u32`).
pub mod irq {
    pub const ENTRY: u8 = 32;
    pub const EXIT: u8 = 33;
    /// Handler attached: irq, interrupt object id (`u32`).
    pub const ATTACH: u8 = 34;
    /// Handler detached: irq, interrupt object id (`u32`).
    pub const DETACH: u8 = 35;
    pub const DISABLE: u8 = 36;
}

/// Scheduler records.
pub mod sched {
    /// Context switch: cpu (`u16`), previous thread, next thread (`u32`,
    /// `u32::MAX` for the host).
    pub const SWITCH: u8 = 48;
    /// Reschedule IPI sent: target cpu mask (`u64`).
    pub const REMOTE: u8 = 49;
    /// Host tick relayed: cpu (`u16`).
    pub const HOST_TICK: u8 = 50;
    /// Watchdog bite: cpu (`u16`), runaway thread (`u32`).
    pub const WATCHDOG: u8 = 51;
}

/// Mode switch records. Payloads start with the thread id (`u32`).
pub mod shadow {
    pub const GOHARD: u8 = 64;
    /// Thread now primary: id, cpu (`u16`).
    pub const HARDENED: u8 = 65;
    /// Relax requested: id, reason code (`u16`).
    pub const GORELAX: u8 = 66;
    pub const RELAXED: u8 = 67;
    pub const KICK: u8 = 68;
    pub const MAYDAY: u8 = 69;
    pub const UNMAP: u8 = 70;
}
