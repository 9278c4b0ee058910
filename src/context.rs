use crate::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ambient cancellation signal, cheap to clone and share with whatever is
/// driving the operation. Cancellation is cooperative: operations check the
/// flag at entry and before suspension points, and either complete fully or
/// leave no observable change.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-operation context threaded as the first parameter to every public
/// operation: the acting user (with precomputed groups), the lock id the
/// caller claims to hold, and the cancellation signal. Tests construct it
/// directly; there is no global.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub user: User,
    pub lock_id: Option<String>,
    pub cancel: CancelFlag,
}

impl OperationContext {
    pub fn new(user: User) -> OperationContext {
        OperationContext {
            user,
            lock_id: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> OperationContext {
        self.lock_id = Some(lock_id.into());
        self
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(FsError::internal("operation cancelled"))
        } else {
            Ok(())
        }
    }
}
