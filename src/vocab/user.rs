use crate::prelude::*;

/// Account class of a user. Lightweight and federated accounts have
/// restricted identity; grants to them inherit across one directory level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Primary,
    Secondary,
    Service,
    Guest,
    Federated,
    Lightweight,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Primary => "primary",
            UserType::Secondary => "secondary",
            UserType::Service => "service",
            UserType::Guest => "guest",
            UserType::Federated => "federated",
            UserType::Lightweight => "lightweight",
        }
    }

    /// Federated accounts share the restricted grant semantics of
    /// lightweight accounts.
    pub fn is_lightweight(&self) -> bool {
        matches!(self, UserType::Lightweight | UserType::Federated)
    }
}

impl Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for UserType {
    type Error = FsError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "primary" => UserType::Primary,
            "secondary" => UserType::Secondary,
            "service" => UserType::Service,
            "guest" => UserType::Guest,
            "federated" => UserType::Federated,
            "lightweight" => UserType::Lightweight,
            _ => {
                return Err(FsError::InvalidArgument(format!(
                    "unknown user type {s:?}"
                )))
            }
        })
    }
}

try_from_str_boilerplate!(UserType);

/// The identity triple stored on nodes. Root and project-space nodes carry an
/// explicit empty triple; `is_empty` distinguishes that from a concrete owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId {
    pub opaque_id: String,
    pub idp: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
}

impl UserId {
    pub fn new(opaque_id: impl Into<String>, idp: impl Into<String>, user_type: UserType) -> UserId {
        UserId {
            opaque_id: opaque_id.into(),
            idp: idp.into(),
            user_type,
        }
    }

    pub fn nobody() -> UserId {
        UserId::new("", "", UserType::Primary)
    }

    pub fn is_empty(&self) -> bool {
        self.opaque_id.is_empty()
    }
}

/// A resolved user as the core needs it: the identity triple plus the
/// precomputed group set for O(1) grant matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub groups: HashSet<String>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>) -> User {
        let username = username.into();
        User {
            id,
            display_name: username.clone(),
            username,
            groups: HashSet::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> User
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// The principal a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grantee {
    User(String),
    Group(String),
    Lightweight(String),
}

impl Grantee {
    pub fn id(&self) -> &str {
        match self {
            Grantee::User(id) | Grantee::Group(id) | Grantee::Lightweight(id) => id,
        }
    }
}
