mod acl;
mod checksum;
mod node_id;
mod permissions;
mod reference;
mod user;

pub use self::acl::{Ace, AceKind, Acl, AclFlags, AclForm};
pub use self::checksum::{Checksum, ChecksumAlgo};
pub use self::node_id::NodeId;
pub use self::permissions::{Grant, Permissions};
pub use self::reference::Reference;
pub use self::user::{Grantee, User, UserId, UserType};
