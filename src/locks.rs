//! Mutual exclusion per peer identity.
//!
//! Announcements for different identities proceed in parallel. Two
//! connections acting on the same identity are serialized for the whole
//! find, update and save sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use tokio::sync::OwnedMutexGuard;

use crate::models::identity::PublicIdentityHandle;

type IdentityMutex = tokio::sync::Mutex<()>;

/// Registry of one async mutex per identity currently in use.
///
/// Entries hold only a weak reference, so an identity nobody is working on
/// costs nothing beyond a map slot, and dead slots are pruned on the next
/// acquisition.
///
/// # Examples
/// ```
/// # use circle_rendezvous::locks::IdentityLocks;
/// # use circle_rendezvous::models::identity::PublicIdentityHandle;
/// # tokio_test::block_on(async {
/// let locks = IdentityLocks::default();
/// let handle: PublicIdentityHandle = "00".repeat(32).parse().unwrap();
/// let guard = locks.lock(&handle).await;
/// assert_eq!(handle, guard.handle());
/// # })
/// ```
#[derive(Debug, Clone, Default)]
pub struct IdentityLocks {
    inner: Arc<Mutex<HashMap<PublicIdentityHandle, Weak<IdentityMutex>>>>,
}

/// Held while working on one identity. Dropping it lets the next waiter in.
#[derive(Debug)]
pub struct IdentityGuard {
    handle: PublicIdentityHandle,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityGuard {
    pub fn handle(&self) -> PublicIdentityHandle {
        self.handle
    }
}

impl IdentityLocks {
    /// Wait until no one else holds `handle`, then take it.
    pub async fn lock(&self, handle: &PublicIdentityHandle) -> IdentityGuard {
        let mutex = self.mutex_for(handle);
        IdentityGuard {
            handle: *handle,
            _guard: mutex.lock_owned().await,
        }
    }

    fn mutex_for(&self, handle: &PublicIdentityHandle) -> Arc<IdentityMutex> {
        // The map holds no invariant a panicking holder could break.
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, mutex| mutex.strong_count() > 0);

        if let Some(mutex) = map.get(handle).and_then(Weak::upgrade) {
            return mutex;
        }
        let mutex = Arc::new(IdentityMutex::default());
        map.insert(*handle, Arc::downgrade(&mutex));
        mutex
    }

    /// Number of identities currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|mutex| mutex.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
