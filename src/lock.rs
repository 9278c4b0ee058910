use crate::prelude::*;
use crate::context::OperationContext;
use crate::layout::Layout;
use crate::util::{flock, with_suffix, LockMode};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Exclusive,
    /// Reserved; `set` currently rejects shared locks.
    Shared,
}

/// The JSON payload of a lock file at `nodes/<pathified-id>.lock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    #[serde(rename = "type")]
    pub kind: LockKind,
    pub holder: UserId,
    pub app_name: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Per-node advisory locks with holder identity and expiry.
///
/// A node has a lock record if and only if its lock file exists and decodes
/// successfully; expired locks are removed lazily on the next read. The lock
/// file itself is created with exclusive-create semantics so two concurrent
/// `set` calls cannot both succeed, and all mutations additionally hold the
/// node's exclusive metadata flock (reads take it shared).
#[derive(Debug, Clone)]
pub struct LockEngine {
    layout: Arc<Layout>,
}

impl LockEngine {
    pub fn new(layout: Arc<Layout>) -> LockEngine {
        LockEngine { layout }
    }

    fn lock_path(&self, id: &NodeId) -> PathBuf {
        self.layout.lock_path(id)
    }

    // Same flock anchor the metadata backend uses for this node, which is
    // what serializes lock mutations against same-node attribute writes.
    fn guard_path(&self, id: &NodeId) -> PathBuf {
        with_suffix(&self.layout.node_dir(id), ".meta.lock")
    }

    /// Decode the lock file. A file that fails to decode is not a lock.
    fn read_record(&self, id: &NodeId) -> Result<Option<LockRecord>> {
        let path = self.lock_path(id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FsError::Internal(e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(node = %id, "undecodable lock file, treating as unlocked: {e}");
                Ok(None)
            }
        }
    }

    /// Read under the guard, dropping an expired lock. Callers hold the
    /// exclusive guard.
    fn read_live(&self, id: &NodeId) -> Result<Option<LockRecord>> {
        match self.read_record(id)? {
            Some(record) if record.expired() => {
                debug!(node = %id, lock = %record.lock_id, "removing expired lock");
                match fs::remove_file(self.lock_path(id)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(FsError::Internal(e)),
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn write_record(&self, id: &NodeId, record: &LockRecord) -> Result<()> {
        let path = self.lock_path(id);
        // unwrap rationale: lock paths always live below nodes/
        let dir = path.parent().unwrap();
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&tmp, record)
            .map_err(|e| FsError::internal(format!("encoding lock record: {e}")))?;
        tmp.as_file().sync_data()?;
        tmp.persist(&path).map_err(|e| FsError::Internal(e.error))?;
        Ok(())
    }

    /// Current lock of the node, if any. Takes the guard shared; expired
    /// locks are removed transparently.
    pub fn get(&self, id: &NodeId) -> Result<Option<LockRecord>> {
        // probe first so the read path doesn't litter guard files for
        // nodes that were never locked
        if !self.lock_path(id).exists() {
            return Ok(None);
        }
        let record = {
            let _guard = flock(&self.guard_path(id), LockMode::Shared)?;
            self.read_record(id)?
        };
        match record {
            Some(r) if r.expired() => {
                let _guard = flock(&self.guard_path(id), LockMode::Exclusive)?;
                self.read_live(id)
            }
            other => Ok(other),
        }
    }

    /// Acquire a lock. Re-acquiring with the held lock id in context replaces
    /// the record (idempotent refresh acquire); anything else while locked
    /// fails with `Locked(current id)`.
    pub fn set(&self, ctx: &OperationContext, id: &NodeId, record: &LockRecord) -> Result<()> {
        if record.kind != LockKind::Exclusive {
            return Err(FsError::InvalidArgument(
                "only exclusive locks are supported".into(),
            ));
        }
        if record.lock_id.is_empty() {
            return Err(FsError::InvalidArgument("empty lock id".into()));
        }
        let _guard = flock(&self.guard_path(id), LockMode::Exclusive)?;
        match self.read_live(id)? {
            None => {
                let path = self.lock_path(id);
                let mut options = fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let file = match options.open(&path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        // lost the create race to a writer outside our guard
                        let current = self.read_record(id)?;
                        return Err(FsError::Locked(
                            current.map(|r| r.lock_id).unwrap_or_default(),
                        ));
                    }
                    Err(e) => return Err(FsError::Internal(e)),
                };
                serde_json::to_writer(&file, record)
                    .map_err(|e| FsError::internal(format!("encoding lock record: {e}")))?;
                file.sync_data()?;
                debug!(node = %id, lock = %record.lock_id, "lock acquired");
                Ok(())
            }
            Some(existing) => {
                if ctx.lock_id.as_deref() == Some(existing.lock_id.as_str()) {
                    self.write_record(id, record)?;
                    debug!(node = %id, lock = %record.lock_id, "lock replaced");
                    Ok(())
                } else {
                    Err(FsError::Locked(existing.lock_id))
                }
            }
        }
    }

    /// Replace the lock with a newer record carrying the same lock id and
    /// holder (typically to push out the expiry).
    pub fn refresh(
        &self,
        ctx: &OperationContext,
        id: &NodeId,
        record: &LockRecord,
    ) -> Result<()> {
        let _guard = flock(&self.guard_path(id), LockMode::Exclusive)?;
        let existing = self
            .read_live(id)?
            .ok_or_else(|| FsError::PreconditionFailed("not locked".into()))?;
        if record.lock_id != existing.lock_id {
            return Err(FsError::PreconditionFailed("mismatching lock".into()));
        }
        if ctx.user.id != existing.holder {
            return Err(FsError::PermissionDenied(format!(
                "lock {} is held by {}",
                existing.lock_id, existing.holder.opaque_id
            )));
        }
        self.write_record(id, record)
    }

    pub fn unlock(
        &self,
        ctx: &OperationContext,
        id: &NodeId,
        record: &LockRecord,
    ) -> Result<()> {
        let _guard = flock(&self.guard_path(id), LockMode::Exclusive)?;
        let existing = self
            .read_live(id)?
            .ok_or_else(|| FsError::PreconditionFailed("not locked".into()))?;
        if record.lock_id != existing.lock_id {
            return Err(FsError::Locked(existing.lock_id));
        }
        if ctx.user.id != existing.holder {
            return Err(FsError::PermissionDenied(format!(
                "lock {} is held by {}",
                existing.lock_id, existing.holder.opaque_id
            )));
        }
        fs::remove_file(self.lock_path(id))?;
        debug!(node = %id, lock = %record.lock_id, "unlocked");
        Ok(())
    }

    /// Verify the caller's claim about the node's lock state before a
    /// mutation.
    pub fn check(&self, ctx: &OperationContext, id: &NodeId) -> Result<()> {
        match (self.get(id)?, &ctx.lock_id) {
            (Some(lock), None) => Err(FsError::Locked(lock.lock_id)),
            (Some(lock), Some(claimed)) => {
                if *claimed == lock.lock_id {
                    Ok(())
                } else {
                    Err(FsError::PreconditionFailed("mismatching lock".into()))
                }
            }
            (None, Some(_)) => Err(FsError::PreconditionFailed("not locked".into())),
            (None, None) => Ok(()),
        }
    }
}
