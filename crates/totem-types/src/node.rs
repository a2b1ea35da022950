//! Node identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A cluster node identifier.
///
/// Stable for the node's lifetime in the cluster. Either operator-assigned
/// or derived from the node's primary IP address at configuration time;
/// this crate treats it as an opaque, totally-ordered 32-bit value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_numerically() {
        assert!(NodeId::new(1) < NodeId::new(2));
        assert!(NodeId::new(10) > NodeId::new(9));
    }

    #[test]
    fn displays_as_decimal() {
        assert_eq!(NodeId::new(42).to_string(), "42");
    }
}
