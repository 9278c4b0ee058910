#![forbid(unsafe_code)]

//! Core of a decomposed filesystem: every file and directory is an opaque
//! node directory addressed by UUID, the name hierarchy is projected through
//! symlinks, and all user-visible metadata lives in a per-node attribute
//! store.

pub mod blobstore;
pub mod context;
pub mod error;
pub mod idcache;
pub mod layout;
pub mod lock;
pub mod metadata;
pub mod node;
pub mod output;
pub mod perms;
pub mod prelude;
pub mod propagate;
pub mod quota;
pub mod recycle;
pub mod tree;
pub mod util;
pub mod vocab;

#[cfg(test)]
mod test_util;
