use core::fmt;

/// Set of CPU numbers below [`CpuSet::MAX_CPUS`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuSet(u64);

impl CpuSet {
    pub const MAX_CPUS: usize = 64;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPUs `0..n`.
    pub const fn first_n(n: usize) -> Self {
        if n >= Self::MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    pub const fn single(cpu: usize) -> Self {
        if cpu < Self::MAX_CPUS {
            Self(1u64 << cpu)
        } else {
            Self(0)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < Self::MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn insert(&mut self, cpu: usize) {
        if cpu < Self::MAX_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    pub fn remove(&mut self, cpu: usize) {
        if cpu < Self::MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest CPU in the set.
    pub const fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Highest CPU in the set.
    pub const fn last(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
