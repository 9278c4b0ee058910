use thiserror::Error;

/// Error kinds surfaced by the core. Callers are expected to match on the
/// variant; the payload is human-readable context only.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("locked by {0}")]
    Locked(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("insufficient storage: {0}")]
    InsufficientStorage(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The node exists but the attribute does not. Recovered locally wherever
    /// the attribute is optional; callers outside the crate should never see
    /// this variant.
    #[error("attribute unset: {0}")]
    AttrUnset(String),
    #[error("internal error: {0}")]
    Internal(#[from] std::io::Error),
}

pub type Result<T, E = FsError> = std::result::Result<T, E>;

impl FsError {
    pub fn internal(msg: impl Into<String>) -> FsError {
        FsError::Internal(std::io::Error::new(
            std::io::ErrorKind::Other,
            msg.into(),
        ))
    }

    /// Map an io error to `NotFound(what)` when the underlying entry is
    /// missing, and to `Internal` otherwise.
    pub fn from_io(err: std::io::Error, what: &str) -> FsError {
        if err.kind() == std::io::ErrorKind::NotFound {
            FsError::NotFound(what.to_owned())
        } else {
            FsError::Internal(err)
        }
    }
}

/// Treat `AttrUnset` as a missing optional.
pub fn optional<T>(r: Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(FsError::AttrUnset(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_optional() {
        assert_eq!(optional(Ok(1)).unwrap(), Some(1));
        assert_eq!(
            optional::<u32>(Err(FsError::AttrUnset("user.test".into()))).unwrap(),
            None
        );
        assert!(optional::<u32>(Err(FsError::internal("boom"))).is_err());
    }

    #[test]
    fn test_from_io() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            FsError::from_io(missing, "node"),
            FsError::NotFound(_)
        ));
        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(FsError::from_io(other, "node"), FsError::Internal(_)));
    }
}
