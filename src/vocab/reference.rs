use crate::prelude::*;

/// A resource reference as clients send it:
/// `<storage-id>$<space-id>!<opaque-id>/relative/path`.
///
/// The delimiters `$`, `!`, `/` round-trip exactly. The relative path is
/// stored without a leading slash and may be empty; the opaque id may be
/// empty, which addresses the space root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
pub struct Reference {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
    pub path: String,
}

impl Reference {
    pub fn new(
        storage_id: impl Into<String>,
        space_id: impl Into<String>,
        opaque_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Reference> {
        let r = Reference {
            storage_id: storage_id.into(),
            space_id: space_id.into(),
            opaque_id: opaque_id.into(),
            path: path.into(),
        };
        if r.space_id.is_empty() {
            return Err(FsError::InvalidArgument("invalid space id".into()));
        }
        Ok(r)
    }

    /// The space root id, which doubles as the space id.
    pub fn space_root(&self) -> Result<NodeId> {
        self.space_id.as_str().try_into()
    }

    /// The node the reference is anchored at: the opaque id if present,
    /// otherwise the space root.
    pub fn anchor(&self) -> Result<NodeId> {
        if self.opaque_id.is_empty() {
            self.space_root()
        } else {
            self.opaque_id.as_str().try_into()
        }
    }

    /// Path segments, rejecting empty, `.`, and `..` components.
    pub fn segments(&self) -> Result<Vec<&str>> {
        if self.path.is_empty() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for seg in self.path.split('/') {
            if seg.is_empty() || seg == "." || seg == ".." {
                return Err(FsError::InvalidArgument(format!(
                    "invalid path segment in {:?}",
                    self.path
                )));
            }
            out.push(seg);
        }
        Ok(out)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}${}!{}", self.storage_id, self.space_id, self.opaque_id)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for Reference {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        static REFERENCE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?-u)^([^$]*)\$([^!]*)!([^/]*)(?:/(.*))?$").unwrap()
        });
        let caps = REFERENCE
            .captures(s)
            .ok_or_else(|| FsError::InvalidArgument(format!("malformed reference {s:?}")))?;
        Reference::new(
            &caps[1],
            &caps[2],
            &caps[3],
            caps.get(4).map(|m| m.as_str()).unwrap_or(""),
        )
    }
}

try_from_str_boilerplate!(Reference);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip() {
        for s in [
            "storage-1$11111111-2222-3333-4444-555555555555!66666666-7777-8888-9999-aaaaaaaaaaaa/dir1/file1",
            "storage-1$space!node",
            "$space!",
            "s$sp!op/a",
        ] {
            let r: Reference = s.try_into().unwrap();
            assert_eq!(r.to_string(), s);
            let again: Reference = r.to_string().as_str().try_into().unwrap();
            assert_eq!(again, r);
        }
    }

    #[test]
    fn test_empty_space_id_rejected() {
        assert!(matches!(
            Reference::try_from("storage$!node/path"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_segments() {
        let r: Reference = "s$sp!op/a/b/c".try_into().unwrap();
        assert_eq!(r.segments().unwrap(), vec!["a", "b", "c"]);
        let root: Reference = "s$sp!op".try_into().unwrap();
        assert!(root.segments().unwrap().is_empty());
        let bad: Reference = Reference {
            storage_id: "s".into(),
            space_id: "sp".into(),
            opaque_id: "op".into(),
            path: "a/../b".into(),
        };
        assert!(bad.segments().is_err());
    }

    #[test]
    fn test_anchor_falls_back_to_root() {
        let root = NodeId::new();
        let r = Reference::new("s", root.to_string(), "", "x").unwrap();
        assert_eq!(r.anchor().unwrap(), root);
    }
}
