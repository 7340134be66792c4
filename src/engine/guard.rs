//! Single-session guard.
//!
//! Every tab of one browser shares a [`LockStore`], looked up by the browser
//! scope id the client sends when it opens a quiz. A tab that starts a
//! session takes the `lock:<quizId>` entry and holds it through a
//! [`LockLease`]; dropping the lease is the only way the entry goes away, so
//! a tab that disappears cannot leave a stale lock behind. Tabs still on the
//! entry screen watch the store's event stream and bail out when another tab
//! takes the lock for their quiz.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::Rejection;

const LOCK_EVENT_BUFFER: usize = 16;

pub fn lock_key(quiz_id: Uuid) -> String {
    format!("lock:{quiz_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired { key: String, holder: Uuid },
    Released { key: String, holder: Uuid },
}

#[derive(Debug)]
pub struct LockStore {
    scope: String,
    entries: Mutex<HashMap<String, Uuid>>,
    events: broadcast::Sender<LockEvent>,
}

impl LockStore {
    pub fn new(scope: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(LOCK_EVENT_BUFFER);
        Arc::new(Self {
            scope: scope.into(),
            entries: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    pub fn holder(&self, quiz_id: Uuid) -> Option<Uuid> {
        self.entries().get(&lock_key(quiz_id)).copied()
    }

    /// Takes the quiz lock for `holder`. Fails if any session, including
    /// an earlier one from the same holder, already has it.
    pub fn try_acquire(self: &Arc<Self>, quiz_id: Uuid, holder: Uuid) -> Result<LockLease, Rejection> {
        let key = lock_key(quiz_id);
        {
            let mut entries = self.entries();
            if let Some(current) = entries.get(&key) {
                tracing::info!(
                    browser.scope = %self.scope,
                    lock.key = %key,
                    lock.holder = %current,
                    session.id = %holder,
                    "Lock already held"
                );
                return Err(Rejection::AlreadyOpenElsewhere);
            }
            entries.insert(key.clone(), holder);
        }

        tracing::debug!(browser.scope = %self.scope, lock.key = %key, session.id = %holder, "Lock acquired");
        // No subscribers is fine; nobody is waiting on the entry screen.
        let _ = self.events.send(LockEvent::Acquired {
            key: key.clone(),
            holder,
        });

        Ok(LockLease {
            store: Arc::clone(self),
            key,
            holder,
        })
    }

    fn release(&self, key: &str, holder: Uuid) {
        let removed = {
            let mut entries = self.entries();
            if entries.get(key) == Some(&holder) {
                entries.remove(key);
                true
            } else {
                false
            }
        };

        if removed {
            tracing::debug!(browser.scope = %self.scope, lock.key = %key, session.id = %holder, "Lock released");
            let _ = self.events.send(LockEvent::Released {
                key: key.to_string(),
                holder,
            });
        }
    }

    fn is_idle(&self) -> bool {
        self.entries().is_empty() && self.events.receiver_count() == 0
    }

    // The map stays consistent even if a holder panicked mid-update, so a
    // poisoned mutex is still usable.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Uuid>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof of holding a quiz lock. Releases the lock when dropped.
#[derive(Debug)]
pub struct LockLease {
    store: Arc<LockStore>,
    key: String,
    holder: Uuid,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.store.release(&self.key, self.holder);
    }
}

/// Lock stores for every browser scope seen so far.
#[derive(Debug, Default)]
pub struct LockRegistry {
    stores: Mutex<HashMap<String, Arc<LockStore>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self, browser_id: &str) -> Arc<LockStore> {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Drop stores nobody references any more.
        stores.retain(|_, store| Arc::strong_count(store) > 1 || !store.is_idle());

        Arc::clone(
            stores
                .entry(browser_id.to_string())
                .or_insert_with(|| LockStore::new(browser_id)),
        )
    }

    pub fn scope_count(&self) -> usize {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_scheme() {
        let quiz_id = Uuid::nil();
        assert_eq!(
            lock_key(quiz_id),
            "lock:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_second_acquire_is_refused_until_release() {
        let store = LockStore::new("browser-a");
        let quiz_id = Uuid::new_v4();
        let first_tab = Uuid::new_v4();
        let second_tab = Uuid::new_v4();

        let lease = store.try_acquire(quiz_id, first_tab).unwrap();
        assert_eq!(store.holder(quiz_id), Some(first_tab));
        assert_eq!(
            store.try_acquire(quiz_id, second_tab).unwrap_err(),
            Rejection::AlreadyOpenElsewhere
        );

        drop(lease);
        assert_eq!(store.holder(quiz_id), None);
        assert!(store.try_acquire(quiz_id, second_tab).is_ok());
    }

    #[test]
    fn test_locks_are_per_quiz() {
        let store = LockStore::new("browser-a");
        let _a = store.try_acquire(Uuid::new_v4(), Uuid::new_v4()).unwrap();
        assert!(store.try_acquire(Uuid::new_v4(), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_scopes_do_not_share_locks() {
        let registry = LockRegistry::new();
        let quiz_id = Uuid::new_v4();

        let browser_a = registry.scope("browser-a");
        let browser_b = registry.scope("browser-b");
        let _lease = browser_a.try_acquire(quiz_id, Uuid::new_v4()).unwrap();

        assert!(browser_b.try_acquire(quiz_id, Uuid::new_v4()).is_ok());
        assert!(Arc::ptr_eq(&browser_a, &registry.scope("browser-a")));
    }

    #[test]
    fn test_idle_scopes_are_pruned() {
        let registry = LockRegistry::new();
        drop(registry.scope("browser-a"));
        let _held = registry.scope("browser-b");

        registry.scope("browser-c");
        // "browser-a" had no users left; "browser-b" is still referenced.
        let _ = registry.scope("browser-b");
        assert_eq!(registry.scope_count(), 1);
    }

    #[tokio::test]
    async fn test_observers_see_acquire_and_release() {
        let store = LockStore::new("browser-a");
        let mut events = store.subscribe();
        let quiz_id = Uuid::new_v4();
        let holder = Uuid::new_v4();

        let lease = store.try_acquire(quiz_id, holder).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent::Acquired {
                key: lock_key(quiz_id),
                holder
            }
        );

        drop(lease);
        assert_eq!(
            events.recv().await.unwrap(),
            LockEvent::Released {
                key: lock_key(quiz_id),
                holder
            }
        );
    }
}
