//! Message sequence numbers.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A ring-scoped message sequence number.
///
/// The first regular multicast in a ring is `Msn(1)`; `Msn(0)` is used as
/// the "nothing delivered yet" sentinel for a fresh ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Msn(pub u32);

impl Msn {
    pub const ZERO: Msn = Msn(0);
    pub const FIRST: Msn = Msn(1);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Msn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u32> for Msn {
    type Output = Msn;
    fn add(self, rhs: u32) -> Msn {
        Msn(self.0 + rhs)
    }
}

impl Sub<Msn> for Msn {
    type Output = u32;
    fn sub(self, rhs: Msn) -> u32 {
        self.0.saturating_sub(rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_regular_multicast_is_one() {
        assert_eq!(Msn::FIRST.get(), 1);
    }

    #[test]
    fn succ_increments() {
        assert_eq!(Msn::new(5).succ(), Msn::new(6));
    }

    #[test]
    fn subtraction_is_saturating_distance() {
        assert_eq!(Msn::new(10) - Msn::new(3), 7);
        assert_eq!(Msn::new(3) - Msn::new(10), 0);
    }
}
