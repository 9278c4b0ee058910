use crate::prelude::*;

bitflags::bitflags! {
    /// The operations a grant can authorize on a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
    pub struct Permissions: u32 {
        const STAT = 1 << 0;
        const LIST_CONTAINER = 1 << 1;
        const CREATE_CONTAINER = 1 << 2;
        const INITIATE_DOWNLOAD = 1 << 3;
        const INITIATE_UPLOAD = 1 << 4;
        const DELETE = 1 << 5;
        const MOVE = 1 << 6;
        const GET_PATH = 1 << 7;
        const GET_QUOTA = 1 << 8;
        const LIST_FILE_VERSIONS = 1 << 9;
        const RESTORE_FILE_VERSION = 1 << 10;
        const LIST_RECYCLE = 1 << 11;
        const RESTORE_RECYCLE_ITEM = 1 << 12;
        const PURGE_RECYCLE = 1 << 13;
        const LIST_GRANTS = 1 << 14;
        const ADD_GRANT = 1 << 15;
        const UPDATE_GRANT = 1 << 16;
        const REMOVE_GRANT = 1 << 17;
        const DENY_GRANT = 1 << 18;
    }
}

const NAMES: &[(Permissions, &str)] = &[
    (Permissions::STAT, "stat"),
    (Permissions::LIST_CONTAINER, "list_container"),
    (Permissions::CREATE_CONTAINER, "create_container"),
    (Permissions::INITIATE_DOWNLOAD, "initiate_download"),
    (Permissions::INITIATE_UPLOAD, "initiate_upload"),
    (Permissions::DELETE, "delete"),
    (Permissions::MOVE, "move"),
    (Permissions::GET_PATH, "get_path"),
    (Permissions::GET_QUOTA, "get_quota"),
    (Permissions::LIST_FILE_VERSIONS, "list_file_versions"),
    (Permissions::RESTORE_FILE_VERSION, "restore_file_version"),
    (Permissions::LIST_RECYCLE, "list_recycle"),
    (Permissions::RESTORE_RECYCLE_ITEM, "restore_recycle_item"),
    (Permissions::PURGE_RECYCLE, "purge_recycle"),
    (Permissions::LIST_GRANTS, "list_grants"),
    (Permissions::ADD_GRANT, "add_grant"),
    (Permissions::UPDATE_GRANT, "update_grant"),
    (Permissions::REMOVE_GRANT, "remove_grant"),
    (Permissions::DENY_GRANT, "deny_grant"),
];

impl Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl TryFrom<&str> for Permissions {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let mut perms = Permissions::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let flag = NAMES
                .iter()
                .find(|(_, n)| *n == name)
                .map(|(f, _)| *f)
                .ok_or_else(|| {
                    FsError::InvalidArgument(format!("unknown permission {name:?}"))
                })?;
            perms |= flag;
        }
        Ok(perms)
    }
}

try_from_str_boilerplate!(Permissions);

fn is_false(b: &bool) -> bool {
    !*b
}

/// A stored ACL entry: the permission set plus the deny marker. The grantee
/// is encoded in the attribute key, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub permissions: Permissions,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deny: bool,
}

impl Grant {
    pub fn allow(permissions: Permissions) -> Grant {
        Grant {
            permissions,
            deny: false,
        }
    }

    pub fn deny(permissions: Permissions) -> Grant {
        Grant {
            permissions,
            deny: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let p = Permissions::STAT | Permissions::LIST_CONTAINER | Permissions::DENY_GRANT;
        assert_eq!(p.to_string(), "stat,list_container,deny_grant");
        let parsed: Permissions = p.to_string().parse().unwrap();
        assert_eq!(parsed, p);

        let all: Permissions = Permissions::all().to_string().parse().unwrap();
        assert_eq!(all, Permissions::all());
        assert_eq!(Permissions::try_from("").unwrap(), Permissions::empty());
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert!(Permissions::try_from("stat,fly").is_err());
    }

    #[test]
    fn test_grant_json() {
        let g = Grant::allow(Permissions::STAT | Permissions::INITIATE_DOWNLOAD);
        let bytes = serde_json::to_vec(&g).unwrap();
        let back: Grant = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, g);
        assert!(!back.deny);

        // deny marker survives
        let d = Grant::deny(Permissions::DELETE);
        let back: Grant = serde_json::from_slice(&serde_json::to_vec(&d).unwrap()).unwrap();
        assert!(back.deny);
    }
}
