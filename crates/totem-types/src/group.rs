//! Opaque process-group names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ApiError, Result};

/// An opaque group name, 1..128 bytes. Equality is byte-exact.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupName(Vec<u8>);

impl GroupName {
    pub const MAX_LEN: usize = 128;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return Err(ApiError::InvalidParam);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "GroupName({s:?})"),
            Err(_) => write!(f, "GroupName({:?})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(GroupName::new(Vec::new()).is_err());
    }

    #[test]
    fn rejects_oversized_name() {
        assert!(GroupName::new(vec![b'x'; GroupName::MAX_LEN + 1]).is_err());
    }

    #[test]
    fn accepts_boundary_length() {
        assert!(GroupName::new(vec![b'x'; GroupName::MAX_LEN]).is_ok());
    }

    #[test]
    fn equality_is_byte_exact() {
        let a = GroupName::new(b"G".to_vec()).expect("valid");
        let b = GroupName::new(b"g".to_vec()).expect("valid");
        assert_ne!(a, b);
    }
}
