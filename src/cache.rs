use crate::image_reference::ImageReference;
use crate::oci_registry::RegistryHandle;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    registry: String,
    repository: String,
    reference: Option<String>,
}

impl CacheKey {
    /// Key for data shared by all tags of a repository, such as its tag list.
    pub fn repository(image_reference: &ImageReference) -> Self {
        Self {
            registry: image_reference.registry_base_url.to_string(),
            repository: image_reference.repository.clone(),
            reference: None,
        }
    }

    /// Key for data of one tagged manifest, such as its digest.
    pub fn manifest(image_reference: &ImageReference) -> Self {
        Self {
            reference: Some(image_reference.tag.clone()),
            ..Self::repository(image_reference)
        }
    }
}

/// A write-once map. Values are never replaced, expired or evicted.
struct Memo<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V: Clone> Memo<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Stores `value` unless the key is already taken and returns whatever is stored.
    fn insert_if_absent(&self, key: K, value: V) -> V {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(value)
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cached = self.get(&key);
        if let Some(value) = cached {
            return Ok(value);
        }
        // no lock is held while fetching, racing callers may fetch the same key
        let value = fetch().await?;
        Ok(self.insert_if_absent(key, value))
    }
}

impl<K, V> Default for Memo<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

/// Process-lifetime memo of registry handles, tag lists and manifest digests.
///
/// Failed fetches are not stored, so a later request retries them.
#[derive(Default)]
pub struct LookupCache {
    handles: Memo<String, Arc<RegistryHandle>>,
    tags: Memo<CacheKey, Vec<String>>,
    digests: Memo<CacheKey, String>,
}

impl LookupCache {
    pub fn get_or_create_handle<F>(&self, url: &Url, create: F) -> Arc<RegistryHandle>
    where
        F: FnOnce() -> RegistryHandle,
    {
        let key = url.to_string();
        if let Some(handle) = self.handles.get(&key) {
            return handle;
        }
        debug!("Creating registry handle for {}", url);
        self.handles.insert_if_absent(key, Arc::new(create()))
    }

    pub async fn get_or_fetch_tags<F, Fut, E>(
        &self,
        key: CacheKey,
        fetch: F,
    ) -> Result<Vec<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
    {
        self.tags.get_or_fetch(key, fetch).await
    }

    pub async fn get_or_fetch_digest<F, Fut, E>(&self, key: CacheKey, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        self.digests.get_or_fetch(key, fetch).await
    }

    /// Number of stored handles, tag lists and digests.
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.handles.len(), self.tags.len(), self.digests.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(repository: &str) -> CacheKey {
        CacheKey {
            registry: "https://registry.example.com/".to_string(),
            repository: repository.to_string(),
            reference: None,
        }
    }

    #[tokio::test]
    async fn test_second_lookup_is_served_from_cache() {
        let cache = LookupCache::default();
        let fetches = &AtomicUsize::new(0);
        let fetch = move || async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(vec!["v1".to_string()])
        };

        let first = cache.get_or_fetch_tags(key("app"), fetch).await.unwrap();
        let second = cache.get_or_fetch_tags(key("app"), fetch).await.unwrap();

        assert_eq!(first, vec!["v1"]);
        assert_eq!(second, vec!["v1"]);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_stored() {
        let cache = LookupCache::default();
        let failed = cache
            .get_or_fetch_digest(key("app"), || async { Err::<String, _>("boom") })
            .await;
        assert_eq!(failed, Err("boom"));

        let digest = cache
            .get_or_fetch_digest(key("app"), || async {
                Ok::<_, &str>("sha256:abc".to_string())
            })
            .await;
        assert_eq!(digest, Ok("sha256:abc".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_for_one_key_store_one_value() {
        let cache = LookupCache::default();
        let fetches = &AtomicUsize::new(0);
        let fetch = move |value: &'static str| {
            move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok::<_, Infallible>(vec![value.to_string()])
            }
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch_tags(key("app"), fetch("a")),
            cache.get_or_fetch_tags(key("app"), fetch("b")),
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        let stored = cache
            .get_or_fetch_tags(key("app"), || async {
                Ok::<_, Infallible>(vec!["never".to_string()])
            })
            .await
            .unwrap();
        assert!(stored == vec!["a"] || stored == vec!["b"]);
        assert_eq!(a.unwrap(), stored);
        assert_eq!(b.unwrap(), stored);
        assert_eq!(cache.sizes(), (0, 1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_tasks_do_not_corrupt_entries() {
        let cache = Arc::new(LookupCache::default());
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch_tags(key("app"), || async move {
                            Ok::<_, Infallible>(vec![format!("v{}", i), format!("v{}.1", i)])
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        let stored = &results[0];
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1], format!("{}.1", stored[0]));
        assert!(results.iter().all(|r| r == stored));
    }

    #[test]
    fn test_manifest_keys_include_tag() {
        let reference = ImageReference {
            registry_base_url: Url::parse("https://ghcr.io").unwrap(),
            registry_host: "ghcr.io".to_string(),
            repository: "org/app".to_string(),
            tag: "latest".to_string(),
        };
        let other_tag = ImageReference {
            tag: "v1".to_string(),
            ..reference.clone()
        };
        assert_eq!(CacheKey::repository(&reference), CacheKey::repository(&other_tag));
        assert_ne!(CacheKey::manifest(&reference), CacheKey::manifest(&other_tag));
    }
}
