//! Platform abstraction: syscall register maps and context switching.
//!
//! A suspended execution context is a plain register file. Each supported
//! architecture describes where the syscall number, arguments, return value
//! and program counter live in that file through [`SyscallAbi`]; the
//! nucleus only goes through [`Arch::abi`].

/// Number of general purpose registers kept per context.
pub const NR_REGS: usize = 32;

/// Saved register file of a thread, or the live one of a CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchContext {
    pub regs: [u64; NR_REGS],
    pub sp: u64,
    /// Times this context was switched in.
    pub switches: u64,
}

impl Default for ArchContext {
    fn default() -> Self {
        Self {
            regs: [0; NR_REGS],
            sp: 0,
            switches: 0,
        }
    }
}

/// Register layout of one architecture's syscall convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub nr: usize,
    pub args: [usize; 6],
    pub ret: usize,
    pub pc: usize,
}

pub trait SyscallAbi {
    const NAME: &'static str;
    const MAP: RegisterMap;
}

pub struct X86_64;

impl SyscallAbi for X86_64 {
    const NAME: &'static str = "x86_64";
    // orig_ax, di, si, dx, r10, r8, r9, ax, ip in a flat pt_regs order.
    const MAP: RegisterMap = RegisterMap {
        nr: 15,
        args: [14, 13, 12, 7, 9, 8],
        ret: 10,
        pc: 16,
    };
}

pub struct Aarch64;

impl SyscallAbi for Aarch64 {
    const NAME: &'static str = "aarch64";
    // x8 carries the number, x0-x5 the arguments, x0 the result.
    const MAP: RegisterMap = RegisterMap {
        nr: 8,
        args: [0, 1, 2, 3, 4, 5],
        ret: 0,
        pc: 31,
    };
}

/// Architecture the nucleus runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arch {
    X86_64,
    Aarch64,
    /// Hosted simulation; uses the x86_64 layout with zero latencies.
    #[default]
    Host,
}

impl Arch {
    pub const fn abi(self) -> &'static RegisterMap {
        match self {
            Self::X86_64 | Self::Host => &X86_64::MAP,
            Self::Aarch64 => &Aarch64::MAP,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::X86_64 => X86_64::NAME,
            Self::Aarch64 => Aarch64::NAME,
            Self::Host => "host",
        }
    }
}

impl ArchContext {
    pub fn syscall_nr(&self, map: &RegisterMap) -> u64 {
        self.regs[map.nr]
    }

    pub fn arg(&self, map: &RegisterMap, n: usize) -> Option<u64> {
        map.args.get(n).map(|reg| self.regs[*reg])
    }

    pub fn set_arg(&mut self, map: &RegisterMap, n: usize, value: u64) -> bool {
        match map.args.get(n) {
            Some(reg) => {
                self.regs[*reg] = value;
                true
            }
            None => false,
        }
    }

    pub fn retval(&self, map: &RegisterMap) -> u64 {
        self.regs[map.ret]
    }

    pub fn set_retval(&mut self, map: &RegisterMap, value: u64) {
        self.regs[map.ret] = value;
    }

    /// Stores a syscall outcome the way user space expects it: the value, or
    /// the negated errno.
    pub fn set_result(&mut self, map: &RegisterMap, result: Result<u64, i32>) {
        let raw = match result {
            Ok(value) => value,
            Err(errno) => (-(errno as i64)) as u64,
        };
        self.set_retval(map, raw);
    }

    pub fn pc(&self, map: &RegisterMap) -> u64 {
        self.regs[map.pc]
    }

    pub fn set_pc(&mut self, map: &RegisterMap, pc: u64) {
        self.regs[map.pc] = pc;
    }
}

/// Cooperative context switch on one CPU: the live register file is saved
/// into `from`, then loaded from `to`.
pub fn switch_to(live: &mut ArchContext, from: &mut ArchContext, to: &ArchContext) {
    let switches = from.switches;
    *from = *live;
    from.switches = switches;
    *live = *to;
    live.switches = to.switches + 1;
}
