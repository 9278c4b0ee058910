use crate::prelude::*;
use std::path::Path;

/// Free bytes on the filesystem backing `path`.
pub fn available_bytes(path: &Path) -> Result<u64> {
    Ok(fs2::available_space(path)?)
}

/// Gate a write of `additional` bytes against both the backing filesystem
/// and the space quota. `limit` is the quota attribute when present and not
/// `unlimited`; `used` is the space root's tree size.
pub fn check(path: &Path, used: u64, limit: Option<u64>, additional: u64) -> Result<()> {
    let free = available_bytes(path)?;
    if additional >= free {
        return Err(FsError::InsufficientStorage("disk full"));
    }
    if let Some(total) = limit {
        // unsigned arithmetic: total may legitimately lag behind used after
        // a quota shrink, which must read as exhausted, not wrap around
        if total < used || additional > total - used {
            return Err(FsError::InsufficientStorage("quota exceeded"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quota_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        // used == total: zero additional bytes are fine, one is not
        assert!(check(tmp.path(), 100, Some(100), 0).is_ok());
        assert!(matches!(
            check(tmp.path(), 100, Some(100), 1),
            Err(FsError::InsufficientStorage("quota exceeded"))
        ));
    }

    #[test]
    fn test_quota_overflow_guard() {
        let tmp = tempfile::tempdir().unwrap();
        // total < used must read as exhausted, not underflow
        assert!(matches!(
            check(tmp.path(), 200, Some(100), 1),
            Err(FsError::InsufficientStorage("quota exceeded"))
        ));
    }

    #[test]
    fn test_no_limit() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(check(tmp.path(), u64::MAX, None, 1024).is_ok());
    }

    #[test]
    fn test_disk_full() {
        let tmp = tempfile::tempdir().unwrap();
        // writing more than the disk holds can never succeed
        assert!(matches!(
            check(tmp.path(), 0, None, u64::MAX),
            Err(FsError::InsufficientStorage("disk full"))
        ));
    }
}
