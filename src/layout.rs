use crate::prelude::*;
use crate::util::with_suffix;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Marker between a node id and the deletion timestamp in the name of a
/// trashed node directory: `<id>.T.<rfc3339nano>`. Safe because ids never
/// contain `.`.
pub const TRASH_SUFFIX: &str = ".T.";

/// Relative target prefix of a child link. All node directories sit at the
/// same sharding depth under `nodes/`, so a link from inside any node
/// directory climbs five levels back to `nodes/` regardless of the parent.
pub const CHILD_LINK_PREFIX: &str = "../../../../../";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    Personal,
    Project,
    Share,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Personal => "personal",
            SpaceType::Project => "project",
            SpaceType::Share => "share",
        }
    }

    pub fn all() -> [SpaceType; 3] {
        [SpaceType::Personal, SpaceType::Project, SpaceType::Share]
    }
}

impl Display for SpaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SpaceType {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "personal" => SpaceType::Personal,
            "project" => SpaceType::Project,
            "share" => SpaceType::Share,
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "unknown space type {s:?}"
                )))
            }
        })
    }
}

try_from_str_boilerplate!(SpaceType);

/// The on-disk layout, relative to a configured root:
///
/// ```text
/// nodes/<pathified-id>/                        node directory
/// nodes/<pathified-id>.T.<rfc3339nano>/        trashed node
/// nodes/<pathified-id>/<name> -> ../../../../../<pathified-child-id>
/// spaces/<type>/<space-id> -> ../../nodes/<pathified-root-id>
/// trash/<space-id>/<node-id> -> ../../nodes/<pathified-id>.T.<timestamp>
/// uploads/<upload-id>                          in-flight uploads (external)
/// changes/<node-id>/<uuid>.bin                 pending propagation records
/// ```
#[derive(Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Result<Layout> {
        let layout = Layout {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(layout.nodes_dir())?;
        fs::create_dir_all(layout.trash_root())?;
        fs::create_dir_all(layout.changes_root())?;
        fs::create_dir_all(layout.uploads_dir())?;
        for space_type in SpaceType::all() {
            fs::create_dir_all(layout.spaces_dir(space_type))?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn spaces_dir(&self, space_type: SpaceType) -> PathBuf {
        self.root.join("spaces").join(space_type.as_str())
    }

    pub fn trash_root(&self) -> PathBuf {
        self.root.join("trash")
    }

    pub fn changes_root(&self) -> PathBuf {
        self.root.join("changes")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// The canonical directory of a node.
    pub fn node_dir(&self, id: &NodeId) -> PathBuf {
        self.nodes_dir().join(id.pathified())
    }

    /// The lock file of a node, next to its directory.
    pub fn lock_path(&self, id: &NodeId) -> PathBuf {
        with_suffix(&self.node_dir(id), ".lock")
    }

    /// The directory of a trashed node.
    pub fn trashed_node_dir(&self, id: &NodeId, timestamp: &str) -> PathBuf {
        with_suffix(&self.node_dir(id), &format!("{TRASH_SUFFIX}{timestamp}"))
    }

    pub fn space_link(&self, space_type: SpaceType, space_id: &NodeId) -> PathBuf {
        self.spaces_dir(space_type).join(space_id.to_string())
    }

    pub fn space_link_target(&self, root_id: &NodeId) -> PathBuf {
        PathBuf::from("../../nodes").join(root_id.pathified())
    }

    pub fn trash_dir(&self, space_id: &NodeId) -> PathBuf {
        self.trash_root().join(space_id.to_string())
    }

    pub fn trash_link(&self, space_id: &NodeId, node_id: &NodeId) -> PathBuf {
        self.trash_dir(space_id).join(node_id.to_string())
    }

    pub fn trash_link_target(&self, node_id: &NodeId, timestamp: &str) -> PathBuf {
        PathBuf::from("../../nodes").join(with_suffix(
            &node_id.pathified(),
            &format!("{TRASH_SUFFIX}{timestamp}"),
        ))
    }

    pub fn changes_dir(&self, node_id: &NodeId) -> PathBuf {
        self.changes_root().join(node_id.to_string())
    }

    /// The target a child link must carry.
    pub fn child_link_target(&self, child_id: &NodeId) -> PathBuf {
        PathBuf::from(CHILD_LINK_PREFIX).join(child_id.pathified())
    }

    /// Decode a child link target back to a node id. Links that don't carry
    /// the internal `..` prefix don't belong to us.
    pub fn parse_child_link(&self, target: &Path) -> Result<NodeId> {
        let s = target.to_string_lossy();
        if !s.starts_with("..") {
            return Err(FsError::internal(format!(
                "invalid layout: child link target {s:?} is not internal"
            )));
        }
        let name = target
            .file_name()
            .ok_or_else(|| {
                FsError::internal(format!("invalid layout: empty child link target {s:?}"))
            })?
            .to_string_lossy();
        name.as_ref()
            .try_into()
            .map_err(|_| FsError::internal(format!("invalid layout: child link target {s:?}")))
    }

    /// Decode a trash link target into the node id and deletion timestamp.
    pub fn parse_trash_link(&self, target: &Path) -> Result<(NodeId, String)> {
        let s = target.to_string_lossy();
        let name = target
            .file_name()
            .ok_or_else(|| {
                FsError::internal(format!("invalid layout: empty trash link target {s:?}"))
            })?
            .to_string_lossy()
            .into_owned();
        let (id, timestamp) = name.split_once(TRASH_SUFFIX).ok_or_else(|| {
            FsError::internal(format!("invalid layout: trash link target {s:?}"))
        })?;
        let id = id
            .try_into()
            .map_err(|_| FsError::internal(format!("invalid layout: trash link target {s:?}")))?;
        Ok((id, timestamp.to_owned()))
    }
}

/// Deletion timestamps: RFC3339 with nanoseconds, UTC.
pub fn trash_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_trash_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FsError::internal(format!("invalid trash timestamp {s:?}")))
}
