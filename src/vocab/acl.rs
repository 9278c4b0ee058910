use crate::prelude::*;
use indexmap::IndexMap;

bitflags::bitflags! {
    /// Single-character ACL permission flags in the EOS-style textual form.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AclFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const LIST = 1 << 2;
        const MANAGE = 1 << 3;
        const UPDATE = 1 << 4;
        const DELETE = 1 << 5;
        const ADD = 1 << 6;
    }
}

// Canonical flag order; serialization emits flags in this order so that
// parse(serialize(a)) == a and consumers see stable strings.
const FLAG_CHARS: &[(AclFlags, char)] = &[
    (AclFlags::READ, 'r'),
    (AclFlags::WRITE, 'w'),
    (AclFlags::LIST, 'x'),
    (AclFlags::MANAGE, 'm'),
    (AclFlags::UPDATE, 'u'),
    (AclFlags::DELETE, 'd'),
    (AclFlags::ADD, 'a'),
];

// Coarse mapping between textual flags and the full permission set, used for
// EOS interchange. A flag maps to a group of permission bits; converting
// permissions back to flags includes a flag only when its whole group is
// present, so flags -> permissions -> flags is the identity.
const FLAG_PERMISSIONS: &[(AclFlags, Permissions)] = &[
    (
        AclFlags::READ,
        Permissions::STAT
            .union(Permissions::GET_PATH)
            .union(Permissions::INITIATE_DOWNLOAD)
            .union(Permissions::LIST_FILE_VERSIONS),
    ),
    (
        AclFlags::WRITE,
        Permissions::INITIATE_UPLOAD.union(Permissions::RESTORE_FILE_VERSION),
    ),
    (
        AclFlags::LIST,
        Permissions::LIST_CONTAINER.union(Permissions::LIST_RECYCLE),
    ),
    (
        AclFlags::MANAGE,
        Permissions::GET_QUOTA
            .union(Permissions::LIST_GRANTS)
            .union(Permissions::ADD_GRANT)
            .union(Permissions::UPDATE_GRANT)
            .union(Permissions::REMOVE_GRANT)
            .union(Permissions::DENY_GRANT),
    ),
    (
        AclFlags::UPDATE,
        Permissions::MOVE.union(Permissions::RESTORE_RECYCLE_ITEM),
    ),
    (
        AclFlags::DELETE,
        Permissions::DELETE.union(Permissions::PURGE_RECYCLE),
    ),
    (AclFlags::ADD, Permissions::CREATE_CONTAINER),
];

impl AclFlags {
    fn parse(s: &str) -> Result<(AclFlags, AclFlags)> {
        let mut grant = AclFlags::empty();
        let mut deny = AclFlags::empty();
        let mut negate = false;
        for c in s.chars() {
            if c == '!' {
                if negate {
                    return Err(FsError::InvalidArgument(format!(
                        "dangling negation in acl permissions {s:?}"
                    )));
                }
                negate = true;
                continue;
            }
            let flag = FLAG_CHARS
                .iter()
                .find(|(_, fc)| *fc == c)
                .map(|(f, _)| *f)
                .ok_or_else(|| {
                    FsError::InvalidArgument(format!("unknown acl flag {c:?}"))
                })?;
            if negate {
                deny |= flag;
                negate = false;
            } else {
                grant |= flag;
            }
        }
        if negate {
            return Err(FsError::InvalidArgument(format!(
                "dangling negation in acl permissions {s:?}"
            )));
        }
        Ok((grant, deny))
    }

    fn render(grant: AclFlags, deny: AclFlags) -> String {
        let mut out = String::new();
        for (flag, c) in FLAG_CHARS {
            if grant.contains(*flag) {
                out.push(*c);
            }
            if deny.contains(*flag) {
                out.push('!');
                out.push(*c);
            }
        }
        out
    }

    /// Expand flags into the permission bits they stand for.
    pub fn to_permissions(&self) -> Permissions {
        let mut perms = Permissions::empty();
        for (flag, group) in FLAG_PERMISSIONS {
            if self.contains(*flag) {
                perms |= *group;
            }
        }
        perms
    }

    /// Collapse a permission set into flags. A flag is included only when all
    /// bits of its group are present.
    pub fn from_permissions(perms: Permissions) -> AclFlags {
        let mut flags = AclFlags::empty();
        for (flag, group) in FLAG_PERMISSIONS {
            if perms.contains(*group) {
                flags |= *flag;
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AceKind {
    User,
    Group,
    Lightweight,
}

impl AceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AceKind::User => "u",
            AceKind::Group => "g",
            AceKind::Lightweight => "lw",
        }
    }
}

impl TryFrom<&str> for AceKind {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "u" => AceKind::User,
            "g" => AceKind::Group,
            "lw" => AceKind::Lightweight,
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "unknown ace type {s:?}"
                )))
            }
        })
    }
}

/// One ACL entry: `type ":" qualifier ":" permissions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    pub kind: AceKind,
    pub qualifier: String,
    pub grant: AclFlags,
    pub deny: AclFlags,
}

impl Ace {
    pub fn new(
        kind: AceKind,
        qualifier: impl Into<String>,
        grant: AclFlags,
        deny: AclFlags,
    ) -> Result<Ace> {
        const DELIMITERS: &[char] = &[':', ',', '#', '\n'];
        let qualifier = qualifier.into();
        // Qualifiers containing delimiter characters would not re-parse;
        // reject them at write time.
        if qualifier.is_empty() || qualifier.contains(DELIMITERS) {
            return Err(FsError::InvalidArgument(format!(
                "invalid ace qualifier {qualifier:?}"
            )));
        }
        Ok(Ace {
            kind,
            qualifier,
            grant,
            deny,
        })
    }
}

impl Display for Ace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind.as_str(),
            self.qualifier,
            AclFlags::render(self.grant, self.deny)
        )
    }
}

impl TryFrom<&str> for Ace {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let mut parts = s.splitn(3, ':');
        let (kind, qualifier, perms) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(q), Some(p)) => (k, q, p),
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "malformed ace {s:?}"
                )))
            }
        };
        let (grant, deny) = AclFlags::parse(perms)?;
        Ace::new(AceKind::try_from(kind)?, qualifier, grant, deny)
    }
}

try_from_str_boilerplate!(Ace);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclForm {
    /// Entries delimited by `,`. Ordering is significant: EOS-compatible
    /// consumers interpret the list positionally.
    Short,
    /// Entries delimited by newlines.
    Long,
}

impl AclForm {
    fn delimiter(&self) -> char {
        match self {
            AclForm::Short => ',',
            AclForm::Long => '\n',
        }
    }
}

/// An ordered ACL. Duplicate `(type, qualifier)` keys keep their first
/// position and take the last value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    entries: IndexMap<(AceKind, String), (AclFlags, AclFlags)>,
}

impl Acl {
    pub fn new() -> Acl {
        Acl::default()
    }

    pub fn push(&mut self, ace: Ace) {
        self.entries
            .insert((ace.kind, ace.qualifier), (ace.grant, ace.deny));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, kind: AceKind, qualifier: &str) -> Option<Ace> {
        self.entries
            .get(&(kind, qualifier.to_owned()))
            .map(|(grant, deny)| Ace {
                kind,
                qualifier: qualifier.to_owned(),
                grant: *grant,
                deny: *deny,
            })
    }

    pub fn entries(&self) -> impl Iterator<Item = Ace> + '_ {
        self.entries.iter().map(|((kind, qualifier), (grant, deny))| Ace {
            kind: *kind,
            qualifier: qualifier.clone(),
            grant: *grant,
            deny: *deny,
        })
    }

    pub fn parse(s: &str, form: AclForm) -> Result<Acl> {
        let mut acl = Acl::new();
        for raw in s.split(form.delimiter()) {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            acl.push(raw.try_into()?);
        }
        Ok(acl)
    }

    pub fn serialize(&self, form: AclForm) -> String {
        let mut out = String::new();
        for (i, ace) in self.entries().enumerate() {
            if i > 0 {
                out.push(form.delimiter());
            }
            out.push_str(&ace.to_string());
        }
        out
    }
}
