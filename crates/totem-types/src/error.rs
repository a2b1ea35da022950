//! Client-facing exit codes.

use serde::{Deserialize, Serialize};

/// The exact error taxonomy exposed across client IPC. Internal subsystem
/// errors (crypto, transport, protocol) are their own `thiserror` enums and
/// get mapped down to one of these at the IPC boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ApiError {
    #[error("not exist")]
    NotExist,
    #[error("already exists")]
    Exist,
    #[error("busy")]
    Busy,
    #[error("try again")]
    TryAgain,
    #[error("access denied")]
    Access,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("out of memory")]
    NoMemory,
    #[error("library error")]
    Library,
    #[error("bad handle")]
    BadHandle,
    #[error("no space left")]
    NoSpace,
    #[error("no sections")]
    NoSections,
    #[error("bad flags")]
    BadFlags,
    #[error("too big")]
    TooBig,
    #[error("message error")]
    MessageError,
}

/// Convenience result alias used across `totem-types` consumers at the API
/// boundary.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_distinct_message() {
        let variants = [
            ApiError::NotExist,
            ApiError::Exist,
            ApiError::Busy,
            ApiError::TryAgain,
            ApiError::Access,
            ApiError::InvalidParam,
            ApiError::NoMemory,
            ApiError::Library,
            ApiError::BadHandle,
            ApiError::NoSpace,
            ApiError::NoSections,
            ApiError::BadFlags,
            ApiError::TooBig,
            ApiError::MessageError,
        ];
        let mut messages: Vec<String> = variants.iter().map(|e| e.to_string()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), variants.len());
    }
}
