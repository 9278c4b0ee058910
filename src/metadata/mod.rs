mod file_backend;

pub use self::file_backend::FileBackend;

use crate::prelude::*;
use auto_impl::auto_impl;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Attribute key namespaces. The exact strings matter: they are shared with
/// other implementations reading the same tree.
pub mod keys {
    pub const PARENT_ID: &str = "user.ocis.parentid";
    pub const NAME: &str = "user.ocis.name";
    pub const BLOB_ID: &str = "user.ocis.blobid";
    pub const BLOB_SIZE: &str = "user.ocis.blobsize";
    pub const OWNER_ID: &str = "user.ocis.owner.id";
    pub const OWNER_IDP: &str = "user.ocis.owner.idp";
    pub const OWNER_TYPE: &str = "user.ocis.owner.type";
    pub const TMTIME: &str = "user.ocis.tmtime";
    pub const TREE_SIZE: &str = "user.ocis.treesize";
    pub const TMP_ETAG: &str = "user.ocis.tmp.etag";
    pub const PROPAGATION: &str = "user.ocis.propagation";
    pub const SPACE_NAME: &str = "user.ocis.space.name";
    pub const QUOTA: &str = "user.ocis.quota";
    pub const TRASH_ORIGIN: &str = "user.ocis.trashorigin";

    pub const GRANT_USER_PREFIX: &str = "user.ocis.grant.u.";
    pub const GRANT_GROUP_PREFIX: &str = "user.ocis.grant.g.";
    pub const GRANT_LIGHTWEIGHT_PREFIX: &str = "user.ocis.grant.lw.";
    pub const FAVORITE_PREFIX: &str = "user.ocis.favorite.";
    pub const CHECKSUM_PREFIX: &str = "user.ocis.cs.";
    pub const METADATA_PREFIX: &str = "user.ocis.metadata.";
}

/// Typed key/value store keyed by node path. Values are opaque byte strings;
/// the backend does not interpret them.
///
/// `AttrUnset` distinguishes "key not present" from `NotFound` ("node not
/// present"). Every write is atomic with respect to concurrent readers of the
/// same node; multi-key writes hold an exclusive file lock on the node's
/// metadata file for the duration.
#[auto_impl(&, Arc)]
pub trait MetadataBackend: Send + Sync {
    fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>>;
    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()>;
    fn set_many(&self, path: &Path, entries: &[(String, Vec<u8>)]) -> Result<()>;
    /// `AttrUnset` when the key is not present.
    fn remove(&self, path: &Path, key: &str) -> Result<()>;
    fn list(&self, path: &Path) -> Result<Vec<String>>;
    fn all(&self, path: &Path) -> Result<HashMap<String, Vec<u8>>>;
    /// Read-modify-write under the node's exclusive metadata lock. The
    /// closure sees the current attribute map and mutates it in place.
    fn update(
        &self,
        path: &Path,
        mutate: &mut dyn FnMut(&mut HashMap<String, Vec<u8>>) -> Result<()>,
    ) -> Result<()>;
    /// Keep attributes attached through a node directory rename (trashing).
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Drop all attributes of a purged node.
    fn purge(&self, path: &Path) -> Result<()>;
}

pub fn get_string(backend: &dyn MetadataBackend, path: &Path, key: &str) -> Result<String> {
    let bytes = backend.get(path, key)?;
    String::from_utf8(bytes)
        .map_err(|_| FsError::internal(format!("attribute {key} is not valid utf-8")))
}

pub fn get_u64(backend: &dyn MetadataBackend, path: &Path, key: &str) -> Result<u64> {
    let s = get_string(backend, path, key)?;
    s.parse()
        .map_err(|_| FsError::internal(format!("attribute {key} is not a number: {s:?}")))
}

pub fn get_time(
    backend: &dyn MetadataBackend,
    path: &Path,
    key: &str,
) -> Result<DateTime<Utc>> {
    let s = get_string(backend, path, key)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FsError::internal(format!("attribute {key} is not a timestamp: {s:?}")))
}
