use crate::prelude::*;
use std::path::PathBuf;
use uuid::Uuid;

// Some filesystems don't cope well with a single directory containing lots of
// entries, so node directories are dispersed over nested shard directories:
// 4 levels of 2 hex characters each, taken from the front of the id, with the
// full id as the final component:
//   nodes/ab/cd/ef/01/abcdef01-....
const SHARD_DEPTH: usize = 4;
const SHARD_WIDTH: usize = 2;

/// Identity of a node: a UUID, rendered in its 36-character lowercase
/// hyphenated form everywhere it appears on disk or on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    /// The sharded relative path of this node under `nodes/`.
    pub fn pathified(&self) -> PathBuf {
        let s = self.to_string();
        let mut path = PathBuf::new();
        for i in 0..SHARD_DEPTH {
            path.push(&s[i * SHARD_WIDTH..(i + 1) * SHARD_WIDTH]);
        }
        path.push(&s);
        path
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::new()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl TryFrom<&str> for NodeId {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let uuid = Uuid::parse_str(s)
            .map_err(|_| FsError::InvalidArgument(format!("invalid node id {s:?}")))?;
        Ok(NodeId(uuid))
    }
}

try_from_str_boilerplate!(NodeId);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_pathified() {
        let id: NodeId = "abcdef01-2345-6789-abcd-ef0123456789".parse().unwrap();
        assert_eq!(
            id.pathified(),
            PathBuf::from("ab/cd/ef/01/abcdef01-2345-6789-abcd-ef0123456789")
        );
    }

    #[test]
    fn test_invalid() {
        assert!(NodeId::try_from("not-a-uuid").is_err());
        assert!(NodeId::try_from("").is_err());
    }
}
