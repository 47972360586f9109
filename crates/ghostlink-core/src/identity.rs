//! Session identity lease.
//!
//! A session identity is the name a client registers under at the relay.
//! It is saved with a bounded lifetime so a client that is briefly
//! suspended reconnects under the same name, and it is discarded on
//! explicit teardown.

use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Length of self-assigned identities
pub const IDENTITY_LEN: usize = 9;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a fresh self-assigned identity (lowercase base-36)
#[must_use]
pub fn generate_identity() -> String {
    let mut rng = rand::thread_rng();
    (0..IDENTITY_LEN)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect()
}

/// Storage for the saved session identity
pub trait IdentityStore: Send + Sync {
    /// Saved identity, if still within its lifetime
    fn load(&self) -> Option<String>;

    /// Save `id`, restarting its lifetime
    fn save(&self, id: &str);

    /// Discard the saved identity
    fn clear(&self);

    /// Reuse the saved identity or generate and save a new one
    fn lease(&self) -> String {
        match self.load() {
            Some(id) => {
                tracing::debug!("Reusing saved session identity {id}");
                id
            }
            None => {
                let id = generate_identity();
                self.save(&id);
                id
            }
        }
    }

    /// Whether `id` is the saved, unexpired identity
    fn is_current(&self, id: &str) -> bool {
        self.load().as_deref() == Some(id)
    }
}

/// In-memory identity store with a fixed lifetime
#[derive(Debug)]
pub struct MemoryIdentityStore {
    ttl: Duration,
    slot: Mutex<Option<(String, Instant)>>,
}

impl MemoryIdentityStore {
    /// Create a store whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<(String, Instant)>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Option<String> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some((id, saved)) if saved.elapsed() < self.ttl => Some(id.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    fn save(&self, id: &str) {
        *self.slot() = Some((id.to_string(), Instant::now()));
    }

    fn clear(&self) {
        *self.slot() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identity_shape() {
        let id = generate_identity();
        assert_eq!(id.len(), IDENTITY_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
    }

    #[test]
    fn test_generated_identities_differ() {
        assert_ne!(generate_identity(), generate_identity());
    }

    #[tokio::test]
    async fn test_lease_reuses_saved() {
        let store = MemoryIdentityStore::new(Duration::from_secs(300));
        let first = store.lease();
        assert_eq!(store.lease(), first);
        assert!(store.is_current(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let store = MemoryIdentityStore::new(Duration::from_secs(300));
        let first = store.lease();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.load(), None);
        assert!(!store.is_current(&first));
    }

    #[tokio::test]
    async fn test_clear_discards() {
        let store = MemoryIdentityStore::new(Duration::from_secs(300));
        let id = store.lease();
        store.clear();
        assert_eq!(store.load(), None);
        assert!(!store.is_current(&id));
    }

    proptest::proptest! {
        #[test]
        fn test_saved_identity_is_current_until_cleared(id in "[a-z0-9]{1,36}") {
            let store = MemoryIdentityStore::new(Duration::from_secs(300));
            store.save(&id);
            proptest::prop_assert!(store.is_current(&id));
            proptest::prop_assert_eq!(store.lease(), id.clone());
            store.clear();
            proptest::prop_assert!(!store.is_current(&id));
        }
    }
}
