use crate::prelude::*;
use crate::blobstore::Blobstore;
use crate::context::OperationContext;
use crate::error::optional;
use crate::layout::{trash_timestamp, Layout, SpaceType};
use crate::lock::LockEngine;
use crate::metadata::{self, keys, FileBackend, MetadataBackend};
use crate::node::{Lookup, Node};
use crate::perms::Evaluator;
use crate::propagate::{self, Propagator};
use crate::recycle::{self, RecycleEntry};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Construction-time configuration. Embedding services deserialize this from
/// their own config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsOptions {
    pub root: PathBuf,
    #[serde(default)]
    pub propagation: propagate::Options,
    /// Id of the storage-wide root node, when the deployment has one;
    /// permission evaluation returns stat-only for it.
    #[serde(default)]
    pub storage_root_id: Option<NodeId>,
}

impl FsOptions {
    pub fn new(root: impl Into<PathBuf>) -> FsOptions {
        FsOptions {
            root: root.into(),
            propagation: propagate::Options::default(),
            storage_root_id: None,
        }
    }
}

/// Findings of a consistency scan.
#[derive(Debug, Default)]
pub struct FsckReport {
    /// Node directories whose parent listing does not reference them.
    pub orphaned_nodes: Vec<NodeId>,
    /// Child links pointing at node directories that no longer exist.
    pub dangling_links: Vec<PathBuf>,
    /// Live nodes still carrying a trash-origin attribute (interrupted
    /// restore).
    pub stale_trash_origins: Vec<NodeId>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_nodes.is_empty()
            && self.dangling_links.is_empty()
            && self.stale_trash_origins.is_empty()
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks not supported on this platform",
    ))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!(
            "invalid node name {name:?}"
        )));
    }
    Ok(())
}

/// The tree engine: creates, moves, deletes and lists nodes, projects the
/// name hierarchy through symlinks, and runs the trash lifecycle.
pub struct Tree {
    lookup: Lookup,
    blobs: Arc<dyn Blobstore>,
    propagator: Propagator,
    evaluator: Evaluator,
    locks: LockEngine,
}

impl Tree {
    pub fn new(opts: FsOptions, blobs: Arc<dyn Blobstore>) -> Result<Tree> {
        Tree::with_backend(opts, blobs, Arc::new(FileBackend::new()))
    }

    pub fn with_backend(
        opts: FsOptions,
        blobs: Arc<dyn Blobstore>,
        meta: Arc<dyn MetadataBackend>,
    ) -> Result<Tree> {
        let layout = Arc::new(Layout::new(&opts.root)?);
        let lookup = Lookup {
            layout: layout.clone(),
            meta,
        };
        let propagator = Propagator::new(lookup.clone(), opts.propagation.clone());
        Ok(Tree {
            locks: LockEngine::new(layout),
            evaluator: Evaluator::new(opts.storage_root_id),
            propagator,
            blobs,
            lookup,
        })
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn locks(&self) -> &LockEngine {
        &self.locks
    }

    pub fn propagator(&self) -> &Propagator {
        &self.propagator
    }

    pub fn blobstore(&self) -> &dyn Blobstore {
        self.blobs.as_ref()
    }

    pub fn node_by_id(&self, space_root: &NodeId, id: &NodeId) -> Result<Node> {
        Node::read_by_id(&self.lookup, *space_root, *id)
    }

    fn authorize(&self, ctx: &OperationContext, node: &Node, needed: Permissions) -> Result<()> {
        let have = self.evaluator.effective(ctx, node)?;
        if have.contains(needed) {
            Ok(())
        } else {
            Err(FsError::PermissionDenied(format!(
                "user {} lacks {} on {}",
                ctx.user.id.opaque_id, needed, node.id
            )))
        }
    }

    /// Propagation failures never fail the originating write.
    fn propagate_logged(&self, parent: &Node, size_delta: i64) {
        if let Err(e) = self.propagator.propagate(parent, size_delta) {
            error!(node = %parent.id, "propagation failed: {e}");
        }
    }

    // --- spaces ---

    /// Create a space: mint a root node and link it under
    /// `spaces/<type>/<space-id>`. The space id equals the root node id.
    pub fn create_space(
        &self,
        ctx: &OperationContext,
        space_type: SpaceType,
        name: &str,
        owner: Option<&UserId>,
        quota: Option<u64>,
    ) -> Result<Node> {
        ctx.check_cancelled()?;
        let id = NodeId::new();
        let dir = self.lookup.layout.node_dir(&id);
        fs::create_dir_all(&dir)?;

        let owner = owner.cloned().unwrap_or_else(UserId::nobody);
        let mut attrs: Vec<(String, Vec<u8>)> = vec![
            (keys::PARENT_ID.to_owned(), vec![]),
            (keys::NAME.to_owned(), name.as_bytes().to_vec()),
            (keys::SPACE_NAME.to_owned(), name.as_bytes().to_vec()),
            (keys::PROPAGATION.to_owned(), b"1".to_vec()),
            (keys::TREE_SIZE.to_owned(), b"0".to_vec()),
            (keys::OWNER_ID.to_owned(), owner.opaque_id.as_bytes().to_vec()),
            (keys::OWNER_IDP.to_owned(), owner.idp.as_bytes().to_vec()),
            (
                keys::OWNER_TYPE.to_owned(),
                owner.user_type.as_str().as_bytes().to_vec(),
            ),
        ];
        if let Some(q) = quota {
            attrs.push((keys::QUOTA.to_owned(), q.to_string().into_bytes()));
        }
        self.lookup.meta.set_many(&dir, &attrs)?;

        let link = self.lookup.layout.space_link(space_type, &id);
        match symlink(&self.lookup.layout.space_link_target(&id), &link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists(format!("space {id}")));
            }
            Err(e) => return Err(FsError::Internal(e)),
        }
        info!(space = %id, space_type = %space_type, "space created");
        Node::read_by_id(&self.lookup, id, id)
    }

    /// Personal space owned by the acting user.
    pub fn create_space_for(&self, ctx: &OperationContext, name: &str) -> Result<Node> {
        self.create_space(ctx, SpaceType::Personal, name, Some(&ctx.user.id), None)
    }

    /// Enumerate space links of one type: `(space id, root node)`.
    pub fn list_spaces(&self, space_type: SpaceType) -> Result<Vec<Node>> {
        let dir = self.lookup.layout.spaces_dir(space_type);
        let mut out = vec![];
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let id = match NodeId::try_from(entry.file_name().to_string_lossy().as_ref()) {
                Ok(id) => id,
                Err(_) => continue,
            };
            out.push(Node::read_by_id(&self.lookup, id, id)?);
        }
        Ok(out)
    }

    // --- resolution ---

    /// Resolve a client reference to a node. The final path segment may not
    /// exist yet; intermediate segments must.
    pub fn lookup_ref(&self, ctx: &OperationContext, reference: &Reference) -> Result<Node> {
        ctx.check_cancelled()?;
        let root = reference.space_root()?;
        let anchor = reference.anchor()?;
        let mut cursor = Node::read_by_id(&self.lookup, root, anchor)?;
        let segments = reference.segments()?;
        for (i, segment) in segments.iter().enumerate() {
            if !cursor.exists {
                return Err(FsError::NotFound(format!("{reference}")));
            }
            let last = i == segments.len() - 1;
            cursor = cursor.child(segment)?;
            if !last && !cursor.exists {
                return Err(FsError::NotFound(format!("{reference}")));
            }
        }
        Ok(cursor)
    }

    fn lookup_path(&self, root: &Node, path: &str) -> Result<Node> {
        let mut cursor = root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            cursor = cursor.child(segment)?;
            if !cursor.exists {
                return Err(FsError::NotFound(format!("{path}")));
            }
        }
        Ok(cursor)
    }

    /// Logical path of a node from its space root, e.g. `/dir1/file1`.
    pub fn path_of(&self, node: &Node) -> Result<String> {
        let mut parts = vec![];
        let mut cursor = node.clone();
        while let Some(parent) = cursor.parent()? {
            parts.push(cursor.name.clone());
            cursor = parent;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    // --- creation ---

    fn initial_attrs(parent: &Node, name: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let owner = parent.owner()?.unwrap_or_else(UserId::nobody);
        Ok(vec![
            (
                keys::PARENT_ID.to_owned(),
                parent.id.to_string().into_bytes(),
            ),
            (keys::NAME.to_owned(), name.as_bytes().to_vec()),
            (keys::OWNER_ID.to_owned(), owner.opaque_id.into_bytes()),
            (keys::OWNER_IDP.to_owned(), owner.idp.into_bytes()),
            (
                keys::OWNER_TYPE.to_owned(),
                owner.user_type.as_str().as_bytes().to_vec(),
            ),
        ])
    }

    /// Create the node directory and attributes, then link it into the
    /// parent listing. The link is last: a crash beforehand leaves an orphan
    /// node directory that fsck collects, never a dangling name.
    fn link_new_node(
        &self,
        parent: &Node,
        name: &str,
        id: &NodeId,
        attrs: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let dir = self.lookup.layout.node_dir(id);
        fs::create_dir_all(&dir)?;
        self.lookup.meta.set_many(&dir, attrs)?;

        let link = parent.dir().join(name);
        match symlink(&self.lookup.layout.child_link_target(id), &link) {
            Ok(()) => Ok(()),
            Err(e) => {
                // best-effort cleanup of the orphan node directory
                let _ = self.lookup.meta.purge(&dir);
                let _ = fs::remove_dir_all(&dir);
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Err(FsError::AlreadyExists(name.to_owned()))
                } else {
                    Err(FsError::Internal(e))
                }
            }
        }
    }

    pub fn create_dir(
        &self,
        ctx: &OperationContext,
        parent: &Node,
        name: &str,
    ) -> Result<Node> {
        ctx.check_cancelled()?;
        check_name(name)?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", parent.id)));
        }
        if !parent.is_dir() {
            return Err(FsError::InvalidArgument(format!(
                "parent {} is not a directory",
                parent.id
            )));
        }
        self.authorize(ctx, parent, Permissions::CREATE_CONTAINER)?;

        let id = NodeId::new();
        let mut attrs = Self::initial_attrs(parent, name)?;
        attrs.push((keys::PROPAGATION.to_owned(), b"1".to_vec()));
        attrs.push((keys::TREE_SIZE.to_owned(), b"0".to_vec()));
        self.link_new_node(parent, name, &id, &attrs)?;

        debug!(node = %id, name, "directory created");
        self.propagate_logged(parent, 0);
        Node::read_by_id(&self.lookup, parent.space_root, id)
    }

    /// Create a file node referencing an already-stored blob.
    pub fn touch(
        &self,
        ctx: &OperationContext,
        parent: &Node,
        name: &str,
        blob_id: &str,
        blob_size: u64,
    ) -> Result<Node> {
        ctx.check_cancelled()?;
        check_name(name)?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", parent.id)));
        }
        if !parent.is_dir() {
            return Err(FsError::InvalidArgument(format!(
                "parent {} is not a directory",
                parent.id
            )));
        }
        self.authorize(ctx, parent, Permissions::INITIATE_UPLOAD)?;

        let root = Node::read_by_id(&self.lookup, parent.space_root, parent.space_root)?;
        root.check_quota(blob_size)?;

        let id = NodeId::new();
        let mut attrs = Self::initial_attrs(parent, name)?;
        attrs.push((keys::BLOB_ID.to_owned(), blob_id.as_bytes().to_vec()));
        attrs.push((
            keys::BLOB_SIZE.to_owned(),
            blob_size.to_string().into_bytes(),
        ));
        self.link_new_node(parent, name, &id, &attrs)?;

        debug!(node = %id, name, blob = blob_id, "file created");
        self.propagate_logged(parent, blob_size as i64);
        Node::read_by_id(&self.lookup, parent.space_root, id)
    }

    /// Store payload bytes and create the file node in one go, recording the
    /// checksums the blobstore computed. The quota is re-checked against the
    /// actual size once known; an oversized payload is deleted again.
    pub fn upload(
        &self,
        ctx: &OperationContext,
        parent: &Node,
        name: &str,
        data: &mut dyn std::io::Read,
    ) -> Result<Node> {
        ctx.check_cancelled()?;
        check_name(name)?;
        self.authorize(ctx, parent, Permissions::INITIATE_UPLOAD)?;

        let blob_id = Uuid::new_v4().to_string();
        let info = self.blobs.upload(&blob_id, data)?;

        let root = Node::read_by_id(&self.lookup, parent.space_root, parent.space_root)?;
        if let Err(e) = root.check_quota(info.size) {
            let _ = self.blobs.delete(&blob_id);
            return Err(e);
        }

        let node = self.touch(ctx, parent, name, &blob_id, info.size)?;
        for checksum in &info.checksums {
            node.set_checksum(checksum)?;
        }
        Ok(node)
    }

    // --- listing ---

    pub fn list_folder(&self, ctx: &OperationContext, dir: &Node) -> Result<Vec<Node>> {
        ctx.check_cancelled()?;
        if !dir.exists {
            return Err(FsError::NotFound(format!("{}", dir.id)));
        }
        if !dir.is_dir() {
            return Err(FsError::InvalidArgument(format!(
                "{} is not a directory",
                dir.id
            )));
        }
        self.authorize(ctx, dir, Permissions::LIST_CONTAINER)?;

        let mut out = vec![];
        for entry in fs::read_dir(dir.dir())? {
            let entry = entry?;
            let target = match fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            // entries whose link is not internal are not ours; drop them
            let id = match self.lookup.layout.parse_child_link(&target) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let mut node = Node::read_by_id(&self.lookup, dir.space_root, id)?;
            node.name = entry.file_name().to_string_lossy().into_owned();
            node.parent_id = Some(dir.id);
            out.push(node);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    // --- move ---

    pub fn move_node(
        &self,
        ctx: &OperationContext,
        node: &Node,
        new_parent: &Node,
        new_name: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        check_name(new_name)?;
        if !node.exists {
            return Err(FsError::NotFound(format!("{}", node.id)));
        }
        if !new_parent.exists || !new_parent.is_dir() {
            return Err(FsError::InvalidArgument(format!(
                "target parent {} is not a directory",
                new_parent.id
            )));
        }
        let old_parent = node
            .parent()?
            .ok_or_else(|| FsError::InvalidArgument("cannot move a space root".into()))?;
        self.authorize(ctx, node, Permissions::MOVE)?;
        self.authorize(ctx, new_parent, Permissions::CREATE_CONTAINER)?;
        self.locks.check(ctx, &node.id)?;

        // moving a directory under itself would detach the subtree
        let mut cursor = Some(new_parent.clone());
        while let Some(n) = cursor {
            if n.id == node.id {
                return Err(FsError::InvalidArgument(
                    "cannot move a node into its own subtree".into(),
                ));
            }
            cursor = n.parent()?;
        }

        let size = node.size()? as i64;
        let old_link = old_parent.dir().join(&node.name);
        let new_link = new_parent.dir().join(new_name);

        // an existing target is replaced, without a trash detour
        if fs::symlink_metadata(&new_link).is_ok() {
            let existing = new_parent.child(new_name)?;
            if existing.exists {
                debug!(node = %existing.id, "removing move target");
                self.purge_tree(&existing.dir())?;
            }
        }
        fs::rename(&old_link, &new_link)?;

        let same_parent = old_parent.id == new_parent.id;
        let parent_attr = new_parent.id.to_string().into_bytes();
        let name_attr = new_name.as_bytes().to_vec();
        self.lookup.meta.update(&node.dir(), &mut |map| {
            map.insert(keys::NAME.to_owned(), name_attr.clone());
            if !same_parent {
                map.insert(keys::PARENT_ID.to_owned(), parent_attr.clone());
            }
            Ok(())
        })?;

        if same_parent {
            self.propagate_logged(&old_parent, 0);
        } else {
            self.propagate_logged(&old_parent, -size);
            self.propagate_logged(new_parent, size);
        }
        Ok(())
    }

    // --- trash lifecycle ---

    /// Soft-delete a node into the space's recycle bin. Returns the recycle
    /// key (the node id).
    pub fn delete(&self, ctx: &OperationContext, node: &Node) -> Result<String> {
        ctx.check_cancelled()?;
        if !node.exists {
            return Err(FsError::NotFound(format!("{}", node.id)));
        }
        let parent = node
            .parent()?
            .ok_or_else(|| FsError::InvalidArgument("cannot delete a space root".into()))?;
        self.authorize(ctx, node, Permissions::DELETE)?;
        self.locks.check(ctx, &node.id)?;

        let size = node.size()? as i64;
        let origin = self.path_of(node)?;
        let node_dir = node.dir();
        self.lookup
            .meta
            .set(&node_dir, keys::TRASH_ORIGIN, origin.as_bytes())?;

        // deletion timestamps must be unique per node; retry until the name
        // is free
        let (timestamp, trashed_dir) = loop {
            let ts = trash_timestamp(&Utc::now());
            let dir = self.lookup.layout.trashed_node_dir(&node.id, &ts);
            if !dir.exists() {
                break (ts, dir);
            }
        };

        let space = node.space_root;
        fs::create_dir_all(self.lookup.layout.trash_dir(&space))?;
        let trash_link = self.lookup.layout.trash_link(&space, &node.id);
        match fs::remove_file(&trash_link) {
            Ok(()) => warn!(node = %node.id, "replacing stale trash link"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::Internal(e)),
        }
        symlink(
            &self.lookup.layout.trash_link_target(&node.id, &timestamp),
            &trash_link,
        )?;

        fs::rename(&node_dir, &trashed_dir)?;
        self.lookup.meta.rename(&node_dir, &trashed_dir)?;
        fs::remove_file(parent.dir().join(&node.name))?;

        info!(node = %node.id, origin, "node trashed");
        self.propagate_logged(&parent, -size);
        Ok(node.id.to_string())
    }

    pub fn list_recycle(
        &self,
        ctx: &OperationContext,
        space: &NodeId,
    ) -> Result<Vec<RecycleEntry>> {
        ctx.check_cancelled()?;
        let root = Node::read_by_id(&self.lookup, *space, *space)?;
        self.authorize(ctx, &root, Permissions::LIST_RECYCLE)?;
        recycle::list(&self.lookup, space)
    }

    /// Restore a recycle entry, to its origin or to a caller-provided
    /// `(parent, name)` target. Refuses an occupied target.
    pub fn restore_recycle(
        &self,
        ctx: &OperationContext,
        space: &NodeId,
        key: &str,
        target: Option<(&Node, &str)>,
    ) -> Result<Node> {
        ctx.check_cancelled()?;
        let node_id: NodeId = key
            .try_into()
            .map_err(|_| FsError::InvalidArgument(format!("invalid recycle key {key:?}")))?;
        let trash_link = self.lookup.layout.trash_link(space, &node_id);
        let link_target = fs::read_link(&trash_link)
            .map_err(|e| FsError::from_io(e, &format!("recycle item {key}")))?;
        let (id, timestamp) = self.lookup.layout.parse_trash_link(&link_target)?;
        let trashed_dir = self.lookup.layout.trashed_node_dir(&id, &timestamp);

        let origin = metadata::get_string(
            self.lookup.meta.as_ref(),
            &trashed_dir,
            keys::TRASH_ORIGIN,
        )?;

        let (parent, name) = match target {
            Some((parent, name)) => {
                check_name(name)?;
                (parent.clone(), name.to_owned())
            }
            None => {
                let (dir_path, name) =
                    origin.rsplit_once('/').unwrap_or(("", origin.as_str()));
                let root = Node::read_by_id(&self.lookup, *space, *space)?;
                (self.lookup_path(&root, dir_path)?, name.to_owned())
            }
        };
        if !parent.exists || !parent.is_dir() {
            return Err(FsError::NotFound(format!("restore parent {}", parent.id)));
        }
        self.authorize(ctx, &parent, Permissions::RESTORE_RECYCLE_ITEM)?;

        let target_link = parent.dir().join(&name);
        if fs::symlink_metadata(&target_link).is_ok() {
            return Err(FsError::AlreadyExists(name));
        }

        symlink(&self.lookup.layout.child_link_target(&id), &target_link)?;
        let node_dir = self.lookup.layout.node_dir(&id);
        fs::rename(&trashed_dir, &node_dir)?;
        self.lookup.meta.rename(&trashed_dir, &node_dir)?;

        let parent_attr = parent.id.to_string().into_bytes();
        let name_attr = name.as_bytes().to_vec();
        self.lookup.meta.update(&node_dir, &mut |map| {
            map.insert(keys::NAME.to_owned(), name_attr.clone());
            map.insert(keys::PARENT_ID.to_owned(), parent_attr.clone());
            map.remove(keys::TRASH_ORIGIN);
            Ok(())
        })?;
        fs::remove_file(&trash_link)?;

        let node = Node::read_by_id(&self.lookup, *space, id)?;
        info!(node = %id, name = %node.name, "node restored");
        self.propagate_logged(&parent, node.size()? as i64);
        Ok(node)
    }

    /// Irrevocably drop a recycle entry: node directories, attributes, blobs
    /// and the trash link.
    pub fn purge_recycle(
        &self,
        ctx: &OperationContext,
        space: &NodeId,
        key: &str,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        let node_id: NodeId = key
            .try_into()
            .map_err(|_| FsError::InvalidArgument(format!("invalid recycle key {key:?}")))?;
        let root = Node::read_by_id(&self.lookup, *space, *space)?;
        self.authorize(ctx, &root, Permissions::PURGE_RECYCLE)?;

        let trash_link = self.lookup.layout.trash_link(space, &node_id);
        let link_target = fs::read_link(&trash_link)
            .map_err(|e| FsError::from_io(e, &format!("recycle item {key}")))?;
        let (id, timestamp) = self.lookup.layout.parse_trash_link(&link_target)?;
        let trashed_dir = self.lookup.layout.trashed_node_dir(&id, &timestamp);

        self.purge_tree(&trashed_dir)?;
        fs::remove_file(&trash_link)?;
        info!(node = %id, "recycle item purged");
        Ok(())
    }

    /// Remove a node directory tree: children (at their canonical paths),
    /// attribute sidecars, and referenced blobs.
    fn purge_tree(&self, dir: &Path) -> Result<()> {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries {
                let entry = entry?;
                if let Ok(target) = fs::read_link(entry.path()) {
                    if let Ok(child_id) = self.lookup.layout.parse_child_link(&target) {
                        self.purge_tree(&self.lookup.layout.node_dir(&child_id))?;
                    }
                }
            }
        }
        let blob_id = optional(metadata::get_string(
            self.lookup.meta.as_ref(),
            dir,
            keys::BLOB_ID,
        ))?
        .filter(|s| !s.is_empty());
        if let Some(blob_id) = blob_id {
            self.blobs.delete(&blob_id)?;
        }
        self.lookup.meta.purge(dir)?;
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Internal(e)),
        }
    }

    // --- consistency scan ---

    /// Reconcile partial states left by crashes: orphaned node directories,
    /// dangling child links, stale trash-origin attributes. With `apply`,
    /// dangling links and stale attributes are removed and orphans purged;
    /// otherwise the scan only reports.
    pub fn fsck(&self, apply: bool) -> Result<FsckReport> {
        let mut report = FsckReport::default();
        self.scan_shard(&self.lookup.layout.nodes_dir(), 0, apply, &mut report)?;
        Ok(report)
    }

    fn scan_shard(
        &self,
        dir: &Path,
        depth: usize,
        apply: bool,
        report: &mut FsckReport,
    ) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if depth < 4 {
                self.scan_shard(&entry.path(), depth + 1, apply, report)?;
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(crate::layout::TRASH_SUFFIX) {
                continue;
            }
            if let Ok(id) = NodeId::try_from(name.as_str()) {
                self.check_node_consistency(&entry.path(), id, apply, report)?;
            }
        }
        Ok(())
    }

    fn check_node_consistency(
        &self,
        dir: &Path,
        id: NodeId,
        apply: bool,
        report: &mut FsckReport,
    ) -> Result<()> {
        let meta = self.lookup.meta.as_ref();

        if optional(meta.get(dir, keys::TRASH_ORIGIN))?.is_some() {
            warn!(node = %id, "live node still carries a trash origin");
            report.stale_trash_origins.push(id);
            if apply {
                match meta.remove(dir, keys::TRASH_ORIGIN) {
                    Ok(()) | Err(FsError::AttrUnset(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let target = match fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if let Ok(child_id) = self.lookup.layout.parse_child_link(&target) {
                if !self.lookup.layout.node_dir(&child_id).exists() {
                    warn!(node = %id, link = ?entry.path(), "dangling child link");
                    report.dangling_links.push(entry.path());
                    if apply {
                        fs::remove_file(entry.path())?;
                    }
                }
            }
        }

        let parent_attr =
            optional(metadata::get_string(meta, dir, keys::PARENT_ID))?.filter(|s| !s.is_empty());
        let parent_id: NodeId = match parent_attr {
            None => return Ok(()), // space root
            Some(s) => match s.as_str().try_into() {
                Ok(pid) => pid,
                Err(_) => return Ok(()),
            },
        };
        let parent_dir = self.lookup.layout.node_dir(&parent_id);
        if parent_dir.exists() {
            let name = optional(metadata::get_string(meta, dir, keys::NAME))?.unwrap_or_default();
            let linked = !name.is_empty()
                && fs::read_link(parent_dir.join(&name))
                    .ok()
                    .and_then(|t| self.lookup.layout.parse_child_link(&t).ok())
                    == Some(id);
            if !linked {
                warn!(node = %id, "orphaned node directory");
                report.orphaned_nodes.push(id);
                if apply {
                    self.purge_tree(dir)?;
                }
            }
        } else if !self.has_trashed_variant(&parent_id)? {
            // parent gone and not trashed: the subtree is unreachable
            warn!(node = %id, parent = %parent_id, "orphaned node, parent missing");
            report.orphaned_nodes.push(id);
            if apply {
                self.purge_tree(dir)?;
            }
        }
        Ok(())
    }

    /// Whether `nodes/<id>.T.<ts>` exists for any timestamp, i.e. the node
    /// was trashed rather than lost.
    fn has_trashed_variant(&self, id: &NodeId) -> Result<bool> {
        let canonical = self.lookup.layout.node_dir(id);
        let shard = match canonical.parent() {
            Some(s) => s,
            None => return Ok(false),
        };
        let prefix = format!("{id}{}", crate::layout::TRASH_SUFFIX);
        let entries = match fs::read_dir(shard) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(FsError::Internal(e)),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::NodeKind;
    use crate::test_util::{ctx, TestFs};

    #[test]
    fn test_create_list_delete() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1234).unwrap();

        let listing = fs.tree.list_folder(&alice, &dir1).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "file1");
        assert_eq!(listing[0].blob_size, 1234);
        assert_eq!(listing[0].id, file1.id);

        let key = fs.tree.delete(&alice, &file1).unwrap();
        assert_eq!(key, file1.id.to_string());
        assert!(fs.tree.list_folder(&alice, &dir1).unwrap().is_empty());

        let entries = fs.tree.list_recycle(&alice, &root.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].restore_path, "/dir1/file1");
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[0].kind, NodeKind::File);
    }

    #[test]
    fn test_restore_to_origin_preserves_everything() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1234).unwrap();
        let owner_before = file1.owner().unwrap();

        let key = fs.tree.delete(&alice, &file1).unwrap();
        let restored = fs
            .tree
            .restore_recycle(&alice, &root.id, &key, None)
            .unwrap();

        assert_eq!(restored.id, file1.id);
        assert_eq!(restored.name, "file1");
        assert_eq!(restored.parent_id, Some(dir1.id));
        assert_eq!(restored.blob_id.as_deref(), Some("b1"));
        assert_eq!(restored.blob_size, 1234);
        assert_eq!(restored.owner().unwrap(), owner_before);
        // trash origin is gone, and so is the recycle entry
        assert!(matches!(
            fs.tree
                .lookup()
                .meta
                .get(&restored.dir(), keys::TRASH_ORIGIN),
            Err(FsError::AttrUnset(_))
        ));
        assert!(fs.tree.list_recycle(&alice, &root.id).unwrap().is_empty());
        assert_eq!(dir1.tree_size().unwrap(), Some(1234));
    }

    #[test]
    fn test_restore_to_alternate_location() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1234).unwrap();

        let key = fs.tree.delete(&alice, &file1).unwrap();
        let restored = fs
            .tree
            .restore_recycle(&alice, &root.id, &key, Some((&dir1, "newloc")))
            .unwrap();

        assert_eq!(restored.id, file1.id);
        assert_eq!(restored.name, "newloc");
        assert_eq!(restored.blob_id.as_deref(), Some("b1"));
        assert!(fs.tree.list_recycle(&alice, &root.id).unwrap().is_empty());
        assert!(!dir1.child("file1").unwrap().exists);
        assert!(dir1.child("newloc").unwrap().exists);
    }

    #[test]
    fn test_restore_refuses_occupied_target() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1).unwrap();
        let key = fs.tree.delete(&alice, &file1).unwrap();
        fs.tree.touch(&alice, &dir1, "file1", "b2", 2).unwrap();

        assert!(matches!(
            fs.tree.restore_recycle(&alice, &root.id, &key, None),
            Err(FsError::AlreadyExists(_))
        ));
        // still restorable elsewhere
        fs.tree
            .restore_recycle(&alice, &root.id, &key, Some((&dir1, "other")))
            .unwrap();
    }

    #[test]
    fn test_purge_removes_everything() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs
            .tree
            .upload(&alice, &dir1, "file1", &mut b"payload".as_slice())
            .unwrap();
        let blob_id = file1.blob_id.clone().unwrap();
        let file_dir = file1.dir();

        let key = fs.tree.delete(&alice, &file1).unwrap();
        fs.tree.purge_recycle(&alice, &root.id, &key).unwrap();

        assert!(!file_dir.exists());
        assert!(fs.tree.list_recycle(&alice, &root.id).unwrap().is_empty());
        assert!(matches!(
            fs.tree.lookup().meta.get(&file_dir, keys::NAME),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.tree.blobstore().download(&blob_id),
            Err(FsError::NotFound(_))
        ));
        // lookup by id no longer succeeds
        assert!(!fs.tree.node_by_id(&root.id, &file1.id).unwrap().exists);
    }

    #[test]
    fn test_deleted_subtree_members_read_as_not_found() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1).unwrap();

        fs.tree.delete(&alice, &dir1).unwrap();
        assert!(matches!(
            fs.tree.node_by_id(&root.id, &file1.id),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_restore_directory_brings_children_back() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 7).unwrap();

        let key = fs.tree.delete(&alice, &dir1).unwrap();
        fs.tree.restore_recycle(&alice, &root.id, &key, None).unwrap();

        let back = fs.tree.node_by_id(&root.id, &file1.id).unwrap();
        assert!(back.exists);
        assert_eq!(back.blob_size, 7);
        assert_eq!(root.tree_size().unwrap(), Some(7));
    }

    #[test]
    fn test_create_dir_name_collision() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        assert!(matches!(
            fs.tree.create_dir(&alice, &root, "dir1"),
            Err(FsError::AlreadyExists(_))
        ));
        // exactly one parent link, and no orphan node directory left behind
        assert_eq!(fs.tree.list_folder(&alice, &root).unwrap().len(), 1);
        assert!(fs.tree.fsck(false).unwrap().is_clean());
    }

    #[test]
    fn test_move_renames_and_reparents() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let dir2 = fs.tree.create_dir(&alice, &root, "dir2").unwrap();
        let file = fs.tree.touch(&alice, &dir1, "file", "b1", 100).unwrap();

        // plain rename
        let file = fs.tree.node_by_id(&root.id, &file.id).unwrap();
        let file = {
            fs.tree.move_node(&alice, &file, &dir1, "renamed").unwrap();
            dir1.child("renamed").unwrap()
        };
        assert!(file.exists);
        assert_eq!(fs.tree.path_of(&file).unwrap(), "/dir1/renamed");

        // reparent
        fs.tree.move_node(&alice, &file, &dir2, "renamed").unwrap();
        assert!(!dir1.child("renamed").unwrap().exists);
        let moved = dir2.child("renamed").unwrap();
        assert!(moved.exists);
        assert_eq!(moved.id, file.id);
        assert_eq!(dir1.tree_size().unwrap(), Some(0));
        assert_eq!(dir2.tree_size().unwrap(), Some(100));
        assert_eq!(root.tree_size().unwrap(), Some(100));
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let sub = fs.tree.create_dir(&alice, &dir1, "sub").unwrap();

        assert!(matches!(
            fs.tree.move_node(&alice, &dir1, &sub, "loop"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_move_replaces_existing_target() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let a = fs.tree.touch(&alice, &root, "a", "ba", 10).unwrap();
        fs.tree.touch(&alice, &root, "b", "bb", 20).unwrap();

        fs.tree.move_node(&alice, &a, &root, "b").unwrap();
        let listing = fs.tree.list_folder(&alice, &root).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, a.id);
        // replaced node went away without a trash entry
        assert!(fs.tree.list_recycle(&alice, &root.id).unwrap().is_empty());
    }

    #[test]
    fn test_locked_node_rejects_delete() {
        let fs = TestFs::new();
        let u1 = ctx("u1");
        let root = fs.tree.create_space_for(&u1, "u1").unwrap();
        let file = fs.tree.touch(&u1, &root, "f", "b1", 1).unwrap();

        let record = crate::lock::LockRecord {
            lock_id: "L1".to_owned(),
            kind: crate::lock::LockKind::Exclusive,
            holder: u1.user.id.clone(),
            app_name: "wopi".to_owned(),
            expires_at: Utc::now() + chrono::Duration::seconds(600),
        };
        fs.tree.locks().set(&u1, &file.id, &record).unwrap();

        match fs.tree.delete(&u1, &file) {
            Err(FsError::Locked(id)) => assert_eq!(id, "L1"),
            other => panic!("expected Locked, got {other:?}"),
        }
        // with the lock id in context the delete goes through
        let held = ctx("u1").with_lock_id("L1");
        fs.tree.delete(&held, &file).unwrap();
    }

    #[test]
    fn test_permissions_enforced_on_ops() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let mallory = ctx("mallory");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();

        assert!(matches!(
            fs.tree.create_dir(&mallory, &dir1, "nope"),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            fs.tree.list_folder(&mallory, &dir1),
            Err(FsError::PermissionDenied(_))
        ));

        dir1.set_grant(
            &Grantee::User("mallory".to_owned()),
            &Grant::allow(Permissions::LIST_CONTAINER),
        )
        .unwrap();
        assert!(fs.tree.list_folder(&mallory, &dir1).is_ok());
    }

    #[test]
    fn test_lookup_ref_round_trip() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 5).unwrap();

        let reference =
            Reference::new("storage-1", root.id.to_string(), "", "dir1/file1").unwrap();
        let resolved = fs.tree.lookup_ref(&alice, &reference).unwrap();
        assert_eq!(resolved.id, file1.id);

        let anchored =
            Reference::new("storage-1", root.id.to_string(), dir1.id.to_string(), "file1")
                .unwrap();
        assert_eq!(fs.tree.lookup_ref(&alice, &anchored).unwrap().id, file1.id);

        let missing =
            Reference::new("storage-1", root.id.to_string(), "", "nope/file1").unwrap();
        assert!(matches!(
            fs.tree.lookup_ref(&alice, &missing),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_upload_records_checksums_and_quota() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs
            .tree
            .create_space(
                &alice,
                SpaceType::Personal,
                "alice",
                Some(&alice.user.id),
                Some(5),
            )
            .unwrap();

        let file = fs
            .tree
            .upload(&alice, &root, "hello", &mut b"hello".as_slice())
            .unwrap();
        assert_eq!(file.blob_size, 5);
        assert_eq!(
            file.checksum(ChecksumAlgo::Sha1).unwrap().unwrap().hex(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(root.tree_size().unwrap(), Some(5));

        // the quota is now exhausted
        assert!(matches!(
            fs.tree.upload(&alice, &root, "more", &mut b"x".as_slice()),
            Err(FsError::InsufficientStorage("quota exceeded"))
        ));
    }

    #[test]
    fn test_tree_size_matches_sum_of_many_files() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "bulk").unwrap();

        let mut expected = 0u64;
        for i in 0..20 {
            let size = fastrand::u64(..10_000);
            expected += size;
            fs.tree
                .touch(&alice, &dir, &format!("f{i}"), &format!("b{i}"), size)
                .unwrap();
        }
        assert_eq!(dir.tree_size().unwrap(), Some(expected));
        assert_eq!(root.tree_size().unwrap(), Some(expected));
    }

    #[test]
    fn test_cancellation_preempts_mutation() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();

        let cancelled = ctx("alice");
        cancelled.cancel.cancel();
        assert!(fs.tree.create_dir(&cancelled, &root, "dir1").is_err());
        assert!(fs.tree.list_folder(&alice, &root).unwrap().is_empty());
    }

    #[test]
    fn test_fsck_finds_and_repairs_dangling_links() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file1 = fs.tree.touch(&alice, &dir1, "file1", "b1", 1).unwrap();

        assert!(fs.tree.fsck(false).unwrap().is_clean());

        // simulate a crash that lost the node directory but kept the link
        fs.tree.lookup().meta.purge(&file1.dir()).unwrap();
        std::fs::remove_dir_all(file1.dir()).unwrap();

        let report = fs.tree.fsck(false).unwrap();
        assert_eq!(report.dangling_links.len(), 1);

        fs.tree.fsck(true).unwrap();
        assert!(fs.tree.fsck(false).unwrap().is_clean());
        assert!(fs.tree.list_folder(&alice, &dir1).unwrap().is_empty());
    }

    #[test]
    fn test_fsck_finds_orphaned_nodes() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir1 = fs.tree.create_dir(&alice, &root, "dir1").unwrap();

        // simulate a crash between node creation and linking
        std::fs::remove_file(root.dir().join("dir1")).unwrap();

        let report = fs.tree.fsck(false).unwrap();
        assert_eq!(report.orphaned_nodes, vec![dir1.id]);

        fs.tree.fsck(true).unwrap();
        assert!(fs.tree.fsck(false).unwrap().is_clean());
        assert!(!dir1.dir().exists());
    }
}
