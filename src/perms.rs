use crate::prelude::*;
use crate::context::OperationContext;
use crate::node::{grantee_from_key, Node};

/// Owners hold every flag.
pub const OWNER_PERMISSIONS: Permissions = Permissions::all();
/// Nodes with an explicitly empty owner that are the configured storage root
/// only admit stat.
pub const NO_OWNER_PERMISSIONS: Permissions = Permissions::STAT;

/// Computes the effective permission set for a `(user, node)` pair by
/// walking grants from the node up to its space root.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    /// Id of the storage-wide root node, when the deployment has one.
    pub storage_root_id: Option<NodeId>,
}

impl Evaluator {
    pub fn new(storage_root_id: Option<NodeId>) -> Evaluator {
        Evaluator { storage_root_id }
    }

    pub fn effective(&self, ctx: &OperationContext, node: &Node) -> Result<Permissions> {
        match node.owner()? {
            Some(owner) if !owner.is_empty() => {
                if owner == ctx.user.id {
                    return Ok(OWNER_PERMISSIONS);
                }
            }
            _ => {
                if self.storage_root_id == Some(node.id) {
                    return Ok(NO_OWNER_PERMISSIONS);
                }
            }
        }

        let mut allowed = Permissions::empty();
        let mut denied = Permissions::empty();
        let mut cursor = Some(node.clone());
        while let Some(n) = cursor {
            let (a, d) = self.grants_at(ctx, &n)?;
            allowed |= a;
            denied |= d;
            cursor = n.parent()?;
        }

        // Grants on directories extend to contained files for lightweight
        // accounts; merge the parent directory's effective permissions.
        if ctx.user.id.user_type.is_lightweight() && !node.is_dir() {
            if let Some(parent) = node.parent()? {
                allowed |= self.effective(ctx, &parent)?;
            }
        }

        Ok(allowed - denied)
    }

    /// One pass over the attribute list of a node; grant values are read only
    /// for keys that match the user or one of their groups.
    fn grants_at(
        &self,
        ctx: &OperationContext,
        node: &Node,
    ) -> Result<(Permissions, Permissions)> {
        let mut allowed = Permissions::empty();
        let mut denied = Permissions::empty();
        for key in node.lookup().meta.list(&node.dir())? {
            let grantee = match grantee_from_key(&key) {
                Some(g) => g,
                None => continue,
            };
            let matches = match &grantee {
                Grantee::User(id) => *id == ctx.user.id.opaque_id,
                Grantee::Group(group) => ctx.user.groups.contains(group),
                Grantee::Lightweight(id) => {
                    ctx.user.id.user_type.is_lightweight() && *id == ctx.user.id.opaque_id
                }
            };
            if !matches {
                continue;
            }
            // the grant may have vanished since listing; skip it then
            if let Some(grant) = node.read_grant(&grantee)? {
                if grant.deny {
                    denied |= grant.permissions;
                } else {
                    allowed |= grant.permissions;
                }
            }
        }
        Ok((allowed, denied))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{ctx, lightweight_ctx, user, TestFs};
    use crate::context::OperationContext;

    #[test]
    fn test_owner_has_everything() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "dir1").unwrap();

        let eval = Evaluator::default();
        assert_eq!(eval.effective(&alice, &dir).unwrap(), OWNER_PERMISSIONS);
    }

    #[test]
    fn test_grant_walks_up_the_tree() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let u3 = ctx("u3");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file = fs.tree.touch(&alice, &dir, "file1", "b1", 1234).unwrap();

        let eval = Evaluator::default();
        assert_eq!(eval.effective(&u3, &file).unwrap(), Permissions::empty());

        let perms =
            Permissions::STAT | Permissions::LIST_CONTAINER | Permissions::INITIATE_DOWNLOAD;
        dir.set_grant(&Grantee::User("u3".to_owned()), &Grant::allow(perms))
            .unwrap();
        assert_eq!(eval.effective(&u3, &file).unwrap(), perms);

        dir.remove_grant(&Grantee::User("u3".to_owned())).unwrap();
        assert_eq!(eval.effective(&u3, &file).unwrap(), Permissions::empty());
    }

    #[test]
    fn test_group_grants_match_the_group_set() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let bob = OperationContext::new(user("bob").with_groups(["staff"]));
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "dir1").unwrap();

        dir.set_grant(
            &Grantee::Group("staff".to_owned()),
            &Grant::allow(Permissions::STAT | Permissions::LIST_CONTAINER),
        )
        .unwrap();
        dir.set_grant(
            &Grantee::Group("admins".to_owned()),
            &Grant::allow(Permissions::all()),
        )
        .unwrap();

        let eval = Evaluator::default();
        assert_eq!(
            eval.effective(&bob, &dir).unwrap(),
            Permissions::STAT | Permissions::LIST_CONTAINER
        );
    }

    #[test]
    fn test_deny_wins() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let u3 = ctx("u3");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let file = fs.tree.touch(&alice, &dir, "file1", "b1", 1).unwrap();

        root.set_grant(
            &Grantee::User("u3".to_owned()),
            &Grant::allow(Permissions::STAT | Permissions::DELETE),
        )
        .unwrap();
        dir.set_grant(
            &Grantee::User("u3".to_owned()),
            &Grant::deny(Permissions::DELETE),
        )
        .unwrap();

        let eval = Evaluator::default();
        assert_eq!(eval.effective(&u3, &file).unwrap(), Permissions::STAT);
    }

    #[test]
    fn test_lightweight_inherits_from_parent_dir_only_for_files() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let guest = lightweight_ctx("guest1");
        let root = fs.tree.create_space_for(&alice, "alice").unwrap();
        let dir = fs.tree.create_dir(&alice, &root, "dir1").unwrap();
        let sub = fs.tree.create_dir(&alice, &dir, "sub").unwrap();
        let file = fs.tree.touch(&alice, &dir, "file1", "b1", 1).unwrap();

        dir.set_grant(
            &Grantee::Lightweight("guest1".to_owned()),
            &Grant::allow(Permissions::STAT | Permissions::INITIATE_DOWNLOAD),
        )
        .unwrap();

        let eval = Evaluator::default();
        // the grant sits on dir itself, so both resolve through the walk; the
        // file additionally merges the parent directory
        assert_eq!(
            eval.effective(&guest, &file).unwrap(),
            Permissions::STAT | Permissions::INITIATE_DOWNLOAD
        );
        assert_eq!(
            eval.effective(&guest, &sub).unwrap(),
            Permissions::STAT | Permissions::INITIATE_DOWNLOAD
        );

        // a primary user with the same opaque id does not match the
        // lightweight grant
        let imposter = ctx("guest1");
        assert_eq!(eval.effective(&imposter, &file).unwrap(), Permissions::empty());
    }

    #[test]
    fn test_no_owner_root_gets_stat_only() {
        let fs = TestFs::new();
        let alice = ctx("alice");
        let root = fs
            .tree
            .create_space(&alice, crate::layout::SpaceType::Project, "shared", None, None)
            .unwrap();

        let eval = Evaluator::new(Some(root.id));
        assert_eq!(eval.effective(&alice, &root).unwrap(), NO_OWNER_PERMISSIONS);
    }
}
