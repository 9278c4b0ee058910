use crate::blobstore::FsBlobstore;
use crate::context::OperationContext;
use crate::tree::{FsOptions, Tree};
use crate::vocab::{User, UserId, UserType};
use std::sync::Arc;

pub struct TestFs {
    // held for its Drop; the directory disappears with the fixture
    #[allow(dead_code)]
    pub tmp: tempfile::TempDir,
    pub tree: Tree,
}

impl TestFs {
    pub fn new() -> TestFs {
        TestFs::with_options(|_| {})
    }

    pub fn with_options(f: impl FnOnce(&mut FsOptions)) -> TestFs {
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = FsOptions::new(tmp.path());
        f(&mut opts);
        let blobs = Arc::new(FsBlobstore::new(&tmp.path().join("blobs")).unwrap());
        let tree = Tree::new(opts, blobs).unwrap();
        TestFs { tmp, tree }
    }
}

pub fn user(name: &str) -> User {
    User::new(UserId::new(name, "https://idp.test", UserType::Primary), name)
}

pub fn ctx(name: &str) -> OperationContext {
    OperationContext::new(user(name))
}

pub fn lightweight_ctx(name: &str) -> OperationContext {
    OperationContext::new(User::new(
        UserId::new(name, "https://idp.test", UserType::Lightweight),
        name,
    ))
}
