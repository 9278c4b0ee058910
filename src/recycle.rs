use crate::prelude::*;
use crate::error::optional;
use crate::layout::parse_trash_timestamp;
use crate::metadata::{self, keys};
use crate::node::{Lookup, NodeKind};
use chrono::{DateTime, Utc};
use std::fs;

/// One soft-deleted subtree root as the recycle listing reports it. The key
/// is the node id of the deleted subtree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycleEntry {
    pub key: String,
    pub node_id: NodeId,
    pub restore_path: String,
    pub deleted_at: DateTime<Utc>,
    pub size: u64,
    pub kind: NodeKind,
}

/// Enumerate the recycle bin of a space, newest deletion first.
pub fn list(lookup: &Lookup, space_id: &NodeId) -> Result<Vec<RecycleEntry>> {
    let dir = lookup.layout.trash_dir(space_id);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(FsError::Internal(e)),
    };

    let mut out = vec![];
    for entry in entries {
        let entry = entry?;
        let target = match fs::read_link(entry.path()) {
            Ok(t) => t,
            Err(e) => {
                warn!("skipping non-symlink trash entry {:?}: {e}", entry.path());
                continue;
            }
        };
        let (node_id, timestamp) = lookup.layout.parse_trash_link(&target)?;
        let trashed_dir = lookup.layout.trashed_node_dir(&node_id, &timestamp);

        let meta = lookup.meta.as_ref();
        let restore_path = match optional(metadata::get_string(
            meta,
            &trashed_dir,
            keys::TRASH_ORIGIN,
        )) {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(node = %node_id, "trashed node without origin attribute");
                String::new()
            }
            Err(FsError::NotFound(_)) => {
                warn!(node = %node_id, "dangling trash link, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };

        let blob_id = optional(metadata::get_string(meta, &trashed_dir, keys::BLOB_ID))?
            .filter(|s| !s.is_empty());
        let (kind, size) = match blob_id {
            Some(_) => (
                NodeKind::File,
                optional(metadata::get_u64(meta, &trashed_dir, keys::BLOB_SIZE))?
                    .unwrap_or(0),
            ),
            None => (
                NodeKind::Directory,
                optional(metadata::get_u64(meta, &trashed_dir, keys::TREE_SIZE))?
                    .unwrap_or(0),
            ),
        };

        out.push(RecycleEntry {
            key: node_id.to_string(),
            node_id,
            restore_path,
            deleted_at: parse_trash_timestamp(&timestamp)?,
            size,
            kind,
        });
    }

    out.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
    Ok(out)
}
