use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::spawn_blocking;

const PSEUDONYM_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz123456789";
const PSEUDONYM_LEN: usize = 4;

/// A durable string to string map.
///
/// Implementations may block; callers on the async side go
/// through [PseudonymStore] which moves the work off the runtime.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Stores `value`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Stores `value` only if `key` has no value yet, then returns
    /// whichever value is now associated with `key`.
    fn insert_if_absent(&self, key: &str, value: &str) -> anyhow::Result<String>;

    fn close(&self) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn insert_if_absent(&self, key: &str, value: &str) -> anyhow::Result<String> {
        Ok(self
            .map
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| value.to_string())
            .clone())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn generate_pseudonym(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let local: String = (0..PSEUDONYM_LEN)
        .map(|_| PSEUDONYM_ALPHABET[rng.gen_range(0..PSEUDONYM_ALPHABET.len())] as char)
        .collect();
    format!("si-{local}@{domain}")
}

/// Maps external correspondents to the address they see us as.
///
/// Keys are the external party's address, lowercased. Inbound mail
/// records the internal recipient it was addressed to; outbound mail
/// reuses that value, or assigns a fresh `si-xxxx` pseudonym.
#[derive(Clone)]
pub struct PseudonymStore {
    store: Arc<dyn KeyValueStore>,
}

impl PseudonymStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    async fn perform<T: Send + 'static>(
        &self,
        func: impl FnOnce(&dyn KeyValueStore) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let store = self.store.clone();
        spawn_blocking(move || func(store.as_ref())).await?
    }

    /// Returns the pseudonym for `recipient` and whether it was
    /// already assigned. A new pseudonym lives in `sender_domain`
    /// and is persisted before being returned.
    pub async fn resolve(
        &self,
        recipient: &str,
        sender_domain: &str,
    ) -> anyhow::Result<(String, bool)> {
        let key = recipient.to_ascii_lowercase();
        let candidate = generate_pseudonym(sender_domain);
        self.perform(move |store| {
            if let Some(existing) = store.get(&key)? {
                return Ok((existing, true));
            }
            let stored = store.insert_if_absent(&key, &candidate)?;
            let existed = stored != candidate;
            if !existed {
                tracing::info!(recipient = %key, pseudonym = %stored, "assigned pseudonym");
            }
            Ok((stored, existed))
        })
        .await
    }

    pub async fn lookup(&self, external: &str) -> anyhow::Result<Option<String>> {
        let key = external.to_ascii_lowercase();
        self.perform(move |store| store.get(&key)).await
    }

    /// Associates an external address with the internal address it wrote to
    pub async fn record(&self, external: &str, internal: &str) -> anyhow::Result<()> {
        let key = external.to_ascii_lowercase();
        let value = internal.to_string();
        self.perform(move |store| store.set(&key, &value)).await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.perform(|store| store.close()).await
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use k9::assert_equal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct CountingStore {
        inner: MemoryStore,
        pub writes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }
        fn insert_if_absent(&self, key: &str, value: &str) -> anyhow::Result<String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.insert_if_absent(key, value)
        }
        fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn pseudonym_shape() {
        let pseudonym = generate_pseudonym("example.jp");
        let (local, domain) = pseudonym.split_once('@').unwrap();
        assert_equal!(domain, "example.jp");
        let suffix = local.strip_prefix("si-").unwrap();
        assert_equal!(suffix.len(), 4);
        assert!(suffix.bytes().all(|b| PSEUDONYM_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let counting = Arc::new(CountingStore::default());
        let store = PseudonymStore::new(counting.clone());

        let (first, existed) = store.resolve("Bob@Example.com", "example.jp").await.unwrap();
        assert!(!existed);
        assert!(first.ends_with("@example.jp"));

        let (second, existed) = store.resolve("bob@example.com", "other.example").await.unwrap();
        assert!(existed);
        assert_equal!(first, second);
        assert_equal!(counting.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recorded_mapping_is_reused() {
        let store = PseudonymStore::memory();
        store
            .record("alice@external.example", "sales@example.jp")
            .await
            .unwrap();
        let (pseudonym, existed) = store
            .resolve("Alice@External.example", "example.jp")
            .await
            .unwrap();
        assert!(existed);
        assert_equal!(pseudonym, "sales@example.jp");
    }

    #[tokio::test]
    async fn concurrent_first_contact_converges() {
        let store = PseudonymStore::memory();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.spawn(async move { store.resolve("carol@example.com", "example.jp").await });
        }
        let mut seen = vec![];
        while let Some(result) = tasks.join_next().await {
            seen.push(result.unwrap().unwrap().0);
        }
        seen.dedup();
        assert_equal!(seen.len(), 1);
    }
}
