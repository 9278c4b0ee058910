use crate::prelude::*;
use crate::context::OperationContext;
use crate::error::optional;
use crate::layout::Layout;
use crate::metadata::{self, keys, MetadataBackend};
use crate::quota;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::unsync::OnceCell;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// The narrow capability bundle a node needs: where node directories live,
/// and the attribute store. Everything else (blobs, propagation, locks) stays
/// with the tree engine.
#[derive(Clone)]
pub struct Lookup {
    pub layout: Arc<Layout>,
    pub meta: Arc<dyn MetadataBackend>,
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookup")
            .field("root", &self.layout.root())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Reference,
    Symlink,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Directory => "directory",
            NodeKind::Reference => "reference",
            NodeKind::Symlink => "symlink",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node as one operation sees it. Instances are short-lived: the attribute
/// cache on a node is never shared across operations, operations re-read
/// instead.
#[derive(Clone)]
pub struct Node {
    lookup: Lookup,
    pub id: NodeId,
    pub space_root: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub blob_id: Option<String>,
    pub blob_size: u64,
    pub exists: bool,
    attrs: OnceCell<HashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id.to_string())
            .field("name", &self.name)
            .field("exists", &self.exists)
            .finish()
    }
}

/// The external projection of a node.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: NodeId,
    pub space_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    pub mime_type: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub etag: String,
    pub owner: Option<UserId>,
    pub favorite: bool,
    pub checksums: Vec<Checksum>,
    pub arbitrary_metadata: HashMap<String, String>,
}

fn mime_type_for(name: &str, kind: NodeKind) -> String {
    if kind == NodeKind::Directory {
        return "httpd/unix-directory".to_owned();
    }
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "txt" | "md" => mime::TEXT_PLAIN,
        "html" | "htm" => mime::TEXT_HTML,
        "css" => mime::TEXT_CSS,
        "csv" => mime::TEXT_CSV,
        "js" => mime::APPLICATION_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "pdf" => mime::APPLICATION_PDF,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        _ => mime::APPLICATION_OCTET_STREAM,
    };
    mime.to_string()
}

/// `"<lowercase hex md5 of (id utf-8 || tmtime bytes)>"`, quotes included.
/// The time contributes its UTC `(seconds i64, nanos u32)` pair big-endian.
/// This exact rendering is what existing clients store and compare.
pub fn calculate_etag(id: &NodeId, t: DateTime<Utc>) -> String {
    let mut md5 = md5::Context::new();
    md5.consume(id.to_string().as_bytes());
    md5.consume(t.timestamp().to_be_bytes());
    md5.consume(t.timestamp_subsec_nanos().to_be_bytes());
    format!("\"{}\"", data_encoding::HEXLOWER.encode(&md5.compute().0))
}

pub fn time_to_attr(t: &DateTime<Utc>) -> Vec<u8> {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes()
}

/// Attribute key for a grant on the given grantee.
pub fn grant_key(grantee: &Grantee) -> String {
    match grantee {
        Grantee::User(id) => format!("{}{id}", keys::GRANT_USER_PREFIX),
        Grantee::Group(id) => format!("{}{id}", keys::GRANT_GROUP_PREFIX),
        Grantee::Lightweight(id) => format!("{}{id}", keys::GRANT_LIGHTWEIGHT_PREFIX),
    }
}

/// Inverse of `grant_key`; `None` for keys outside the grant namespaces.
pub fn grantee_from_key(key: &str) -> Option<Grantee> {
    if let Some(id) = key.strip_prefix(keys::GRANT_USER_PREFIX) {
        Some(Grantee::User(id.to_owned()))
    } else if let Some(id) = key.strip_prefix(keys::GRANT_GROUP_PREFIX) {
        Some(Grantee::Group(id.to_owned()))
    } else if let Some(id) = key.strip_prefix(keys::GRANT_LIGHTWEIGHT_PREFIX) {
        Some(Grantee::Lightweight(id.to_owned()))
    } else {
        None
    }
}

fn favorite_key(user: &UserId) -> String {
    format!(
        "{}{}:{}@{}",
        keys::FAVORITE_PREFIX,
        user.user_type.as_str(),
        user.opaque_id,
        user.idp
    )
}

impl Node {
    /// A handle for a node that is not (or not yet) on disk. The id is
    /// freshly minted so a subsequent create can use it.
    pub fn not_existing(
        lookup: &Lookup,
        space_root: NodeId,
        parent_id: Option<NodeId>,
        name: &str,
    ) -> Node {
        Node {
            lookup: lookup.clone(),
            id: NodeId::new(),
            space_root,
            parent_id,
            name: name.to_owned(),
            blob_id: None,
            blob_size: 0,
            exists: false,
            attrs: OnceCell::new(),
        }
    }

    /// Read a node by id. Returns a handle with `exists == false` when the
    /// node directory is missing, and `NotFound` when the node's parent
    /// directory is missing (the node is part of a deleted subtree).
    pub fn read_by_id(lookup: &Lookup, space_root: NodeId, id: NodeId) -> Result<Node> {
        let dir = lookup.layout.node_dir(&id);
        let parent_attr = match metadata::get_string(lookup.meta.as_ref(), &dir, keys::PARENT_ID)
        {
            Ok(s) => Some(s),
            Err(FsError::AttrUnset(_)) => None,
            Err(FsError::NotFound(_)) => {
                let mut node = Node::not_existing(lookup, space_root, None, "");
                node.id = id;
                return Ok(node);
            }
            Err(e) => return Err(e),
        };
        let parent_id = match parent_attr.as_deref() {
            None | Some("") => None,
            Some(s) => Some(s.try_into()?),
        };
        if let Some(pid) = &parent_id {
            if !lookup.layout.node_dir(pid).exists() {
                return Err(FsError::NotFound(format!(
                    "node {id} is part of a deleted subtree"
                )));
            }
        }
        let name = optional(metadata::get_string(lookup.meta.as_ref(), &dir, keys::NAME))?
            .unwrap_or_default();
        let blob_id = optional(metadata::get_string(lookup.meta.as_ref(), &dir, keys::BLOB_ID))?
            .filter(|s| !s.is_empty());
        let blob_size =
            optional(metadata::get_u64(lookup.meta.as_ref(), &dir, keys::BLOB_SIZE))?
                .unwrap_or(0);
        Ok(Node {
            lookup: lookup.clone(),
            id,
            space_root,
            parent_id,
            name,
            blob_id,
            blob_size,
            exists: true,
            attrs: OnceCell::new(),
        })
    }

    /// Resolve a child by name through the parent-listing symlink.
    pub fn child(&self, name: &str) -> Result<Node> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument(format!(
                "invalid node name {name:?}"
            )));
        }
        let link = self.dir().join(name);
        let target = match fs::read_link(&link) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Node::not_existing(
                    &self.lookup,
                    self.space_root,
                    Some(self.id),
                    name,
                ));
            }
            Err(e) => return Err(FsError::Internal(e)),
        };
        let id = self.lookup.layout.parse_child_link(&target)?;
        let mut node = Node::read_by_id(&self.lookup, self.space_root, id)?;
        node.name = name.to_owned();
        node.parent_id = Some(self.id);
        Ok(node)
    }

    /// `None` for space roots.
    pub fn parent(&self) -> Result<Option<Node>> {
        match self.parent_id {
            None => Ok(None),
            Some(pid) => Node::read_by_id(&self.lookup, self.space_root, pid).map(Some),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.lookup.layout.node_dir(&self.id)
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn kind(&self) -> NodeKind {
        if self.blob_id.is_some() {
            NodeKind::File
        } else {
            NodeKind::Directory
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    /// Blob size for files, tree size for directories.
    pub fn size(&self) -> Result<u64> {
        if self.is_dir() {
            Ok(self.tree_size()?.unwrap_or(0))
        } else {
            Ok(self.blob_size)
        }
    }

    fn meta(&self) -> &dyn MetadataBackend {
        self.lookup.meta.as_ref()
    }

    fn attrs(&self) -> Result<&HashMap<String, Vec<u8>>> {
        self.attrs.get_or_try_init(|| self.meta().all(&self.dir()))
    }

    /// The owner triple. `None` when the attributes were never written,
    /// `Some` with an empty opaque id for roots and project spaces.
    pub fn owner(&self) -> Result<Option<UserId>> {
        let opaque = match optional(metadata::get_string(
            self.meta(),
            &self.dir(),
            keys::OWNER_ID,
        ))? {
            None => return Ok(None),
            Some(s) => s,
        };
        let idp = optional(metadata::get_string(self.meta(), &self.dir(), keys::OWNER_IDP))?
            .unwrap_or_default();
        let user_type = optional(metadata::get_string(
            self.meta(),
            &self.dir(),
            keys::OWNER_TYPE,
        ))?
        .filter(|s| !s.is_empty())
        .map(|s| UserType::try_from(s.as_str()))
        .transpose()?
        .unwrap_or(UserType::Primary);
        Ok(Some(UserId::new(opaque, idp, user_type)))
    }

    // --- grants ---

    pub fn set_grant(&self, grantee: &Grantee, grant: &Grant) -> Result<()> {
        let value = serde_json::to_vec(grant)
            .map_err(|e| FsError::internal(format!("encoding grant: {e}")))?;
        self.meta().set(&self.dir(), &grant_key(grantee), &value)
    }

    pub fn remove_grant(&self, grantee: &Grantee) -> Result<()> {
        self.meta().remove(&self.dir(), &grant_key(grantee))
    }

    /// A grant may vanish between listing and reading; `Ok(None)` is
    /// "disappeared", `Err` is a real read failure.
    pub fn read_grant(&self, grantee: &Grantee) -> Result<Option<Grant>> {
        let bytes = match optional(self.meta().get(&self.dir(), &grant_key(grantee)))? {
            None => return Ok(None),
            Some(b) => b,
        };
        let grant = serde_json::from_slice(&bytes).map_err(|e| {
            FsError::internal(format!("corrupt grant on node {}: {e}", self.id))
        })?;
        Ok(Some(grant))
    }

    /// Grantees only; permissions require a second read per grantee.
    pub fn list_grantees(&self) -> Result<Vec<Grantee>> {
        Ok(self
            .meta()
            .list(&self.dir())?
            .iter()
            .filter_map(|k| grantee_from_key(k))
            .collect())
    }

    pub fn list_grants(&self) -> Result<Vec<(Grantee, Grant)>> {
        let mut out = vec![];
        for grantee in self.list_grantees()? {
            if let Some(grant) = self.read_grant(&grantee)? {
                out.push((grantee, grant));
            }
        }
        Ok(out)
    }

    // --- favorites ---

    pub fn set_favorite(&self, user: &UserId, value: bool) -> Result<()> {
        let key = favorite_key(user);
        if value {
            self.meta().set(&self.dir(), &key, b"1")
        } else {
            match self.meta().remove(&self.dir(), &key) {
                Ok(()) | Err(FsError::AttrUnset(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    pub fn is_favorite(&self, user: &UserId) -> Result<bool> {
        Ok(
            optional(self.meta().get(&self.dir(), &favorite_key(user)))?
                .map(|v| v == b"1")
                .unwrap_or(false),
        )
    }

    // --- checksums ---

    pub fn set_checksum(&self, checksum: &Checksum) -> Result<()> {
        let key = format!("{}{}", keys::CHECKSUM_PREFIX, checksum.algo);
        self.meta().set(&self.dir(), &key, &checksum.raw)
    }

    pub fn checksum(&self, algo: ChecksumAlgo) -> Result<Option<Checksum>> {
        let key = format!("{}{algo}", keys::CHECKSUM_PREFIX);
        Ok(optional(self.meta().get(&self.dir(), &key))?
            .map(|raw| Checksum { algo, raw }))
    }

    // --- tree stats ---

    pub fn tree_size(&self) -> Result<Option<u64>> {
        optional(metadata::get_u64(self.meta(), &self.dir(), keys::TREE_SIZE))
    }

    pub fn set_tree_size(&self, size: u64) -> Result<()> {
        self.meta()
            .set(&self.dir(), keys::TREE_SIZE, size.to_string().as_bytes())
    }

    /// Tree modification time; tolerates a malformed attribute (treated as
    /// unset, the propagator overwrites it).
    pub fn tmtime(&self) -> Result<Option<DateTime<Utc>>> {
        match metadata::get_time(self.meta(), &self.dir(), keys::TMTIME) {
            Ok(t) => Ok(Some(t)),
            Err(FsError::AttrUnset(_)) => Ok(None),
            Err(FsError::Internal(e)) => {
                warn!(node = %self.id, "ignoring malformed tmtime: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn set_tmtime(&self, t: &DateTime<Utc>) -> Result<()> {
        self.meta().set(&self.dir(), keys::TMTIME, &time_to_attr(t))
    }

    pub fn unset_tmp_etag(&self) -> Result<()> {
        match self.meta().remove(&self.dir(), keys::TMP_ETAG) {
            Ok(()) | Err(FsError::AttrUnset(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether tree-stat propagation crosses this node upward.
    pub fn propagation_enabled(&self) -> Result<bool> {
        Ok(
            optional(self.meta().get(&self.dir(), keys::PROPAGATION))?
                .map(|v| v == b"1")
                .unwrap_or(false),
        )
    }

    pub fn set_propagation(&self, enabled: bool) -> Result<()> {
        let value: &[u8] = if enabled { b"1" } else { b"0" };
        self.meta().set(&self.dir(), keys::PROPAGATION, value)
    }

    /// Filesystem mtime of the node directory.
    pub fn mtime(&self) -> Result<DateTime<Utc>> {
        let md = fs::metadata(self.dir())
            .map_err(|e| FsError::from_io(e, &self.id.to_string()))?;
        Ok(md.modified()?.into())
    }

    pub fn etag(&self) -> Result<String> {
        let mtime = self.mtime()?;
        let t = match self.tmtime()? {
            Some(tm) => tm.max(mtime),
            None => mtime,
        };
        Ok(calculate_etag(&self.id, t))
    }

    // --- quota ---

    /// Check, on a space root, that `additional` bytes fit both the backing
    /// filesystem and the quota attribute (absent or `unlimited` means no
    /// limit).
    pub fn check_quota(&self, additional: u64) -> Result<()> {
        let limit = match optional(metadata::get_string(
            self.meta(),
            &self.dir(),
            keys::QUOTA,
        ))? {
            None => None,
            Some(s) if s == "unlimited" => None,
            Some(s) => Some(s.parse::<u64>().map_err(|_| {
                FsError::internal(format!("invalid quota attribute {s:?} on {}", self.id))
            })?),
        };
        let used = self.tree_size()?.unwrap_or(0);
        quota::check(&self.dir(), used, limit, additional)
    }

    // --- projection ---

    /// Project the node into its external view. `mask` selects arbitrary
    /// metadata keys; `["*"]` selects all of them, unknown keys are silently
    /// dropped.
    pub fn as_resource_info(
        &self,
        ctx: &OperationContext,
        mask: &[&str],
    ) -> Result<ResourceInfo> {
        let kind = self.kind();
        let mtime = self.mtime()?;
        let tmtime = self.tmtime()?;
        let t = tmtime.map_or(mtime, |tm| tm.max(mtime));
        let computed = calculate_etag(&self.id, t);
        let etag = match optional(metadata::get_string(
            self.meta(),
            &self.dir(),
            keys::TMP_ETAG,
        ))? {
            Some(tmp) if tmp != computed => tmp,
            _ => computed,
        };

        let attrs = self.attrs()?;
        let wildcard = mask.contains(&"*");
        let mut arbitrary_metadata = HashMap::new();
        for (key, value) in attrs {
            if let Some(name) = key.strip_prefix(keys::METADATA_PREFIX) {
                if wildcard || mask.contains(&name) {
                    arbitrary_metadata
                        .insert(name.to_owned(), String::from_utf8_lossy(value).into_owned());
                }
            }
        }

        let mut checksums = vec![];
        for algo in ChecksumAlgo::all() {
            if let Some(c) = self.checksum(algo)? {
                checksums.push(c);
            }
        }

        Ok(ResourceInfo {
            id: self.id,
            space_id: self.space_root,
            parent_id: self.parent_id,
            name: self.name.clone(),
            kind,
            mime_type: mime_type_for(&self.name, kind),
            size: self.size()?,
            mtime: t,
            etag,
            owner: self.owner()?,
            favorite: self.is_favorite(&ctx.user.id)?,
            checksums,
            arbitrary_metadata,
        })
    }

    pub fn set_arbitrary_metadata(&self, key: &str, value: &str) -> Result<()> {
        let attr = format!("{}{key}", keys::METADATA_PREFIX);
        self.meta().set(&self.dir(), &attr, value.as_bytes())
    }
}
