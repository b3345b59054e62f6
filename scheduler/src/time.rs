/// A point on the guest timeline, counted in CPU cycles since reset.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Time {
    pub(crate) cycles: u64
}

impl Time {
    pub const ZERO: Self = Time {
        cycles: 0
    };

    pub const MAX: Self = Time {
        cycles: u64::MAX
    };

    pub fn cycles(self) -> u64 {
        self.cycles
    }

    pub fn add(self, other: u64) -> Self {
        Time {
            cycles: self.cycles.saturating_add(other)
        }
    }

    /// Cycles elapsed between `earlier` and `self`, zero if `earlier` is actually later.
    pub fn since(self, earlier: Time) -> u64 {
        self.cycles.saturating_sub(earlier.cycles)
    }
}

impl From<Time> for u64 {
    fn from(value: Time) -> Self {
        value.cycles
    }
}

impl From<u64> for Time {
    fn from(cycles: u64) -> Self {
        Time {
            cycles
        }
    }
}
