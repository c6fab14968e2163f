//! Large binary payloads live outside the synced tree. An entity only stores the URL a
//! [`BlobStore`] handed back, as an ordinary string field.

use std::rc::Rc;
use std::sync::Arc;

use chokepoint::ChokePoint;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("download failed: {0}")]
    Download(String),
}

pub trait BlobStore {
    fn put_blob(&self, bytes: Vec<u8>) -> impl Future<Output = Result<String, BlobError>>;

    fn get_blob(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, BlobError>>;
}

/// Memoizes downloads and collapses concurrent fetches of the same URL into one request.
pub struct BlobCache<B> {
    store: Rc<B>,
    downloads: ChokePoint<String, Vec<u8>, BlobError>,
}

impl<B: BlobStore + 'static> BlobCache<B> {
    pub fn new(store: B) -> Self {
        Self {
            store: Rc::new(store),
            downloads: ChokePoint::new(),
        }
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub async fn put(&self, bytes: Vec<u8>) -> Result<String, BlobError> {
        let url = self.store.put_blob(bytes).await?;
        log::debug!("Uploaded blob to {url}");
        Ok(url)
    }

    pub async fn get(&self, url: &str) -> Result<Arc<Vec<u8>>, BlobError> {
        let store = Rc::clone(&self.store);
        let owned = url.to_string();
        self.downloads
            .get(url.to_string(), async move { store.get_blob(&owned).await })
            .await
    }

    /// Drops a downloaded blob so the next `get` fetches it again.
    pub fn evict(&self, url: &str) -> bool {
        self.downloads.forget(&url.to_string())
    }
}

/// Blob store kept in process memory, for tests and demos.
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: std::cell::RefCell<std::collections::HashMap<String, Vec<u8>>>,
    fetches: std::cell::Cell<usize>,
    unavailable: std::cell::Cell<bool>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `get_blob` actually ran.
    pub fn fetches(&self) -> usize {
        self.fetches.get()
    }

    /// While unavailable, uploads and downloads fail the way an unreachable blob service would.
    pub fn set_available(&self, available: bool) {
        self.unavailable.set(!available);
    }
}

impl BlobStore for MemoryBlobs {
    async fn put_blob(&self, bytes: Vec<u8>) -> Result<String, BlobError> {
        if self.unavailable.get() {
            return Err(BlobError::Upload("blob store unavailable".to_string()));
        }
        let mut blobs = self.blobs.borrow_mut();
        let url = format!("memory://blob/{}", blobs.len());
        blobs.insert(url.clone(), bytes);
        Ok(url)
    }

    async fn get_blob(&self, url: &str) -> Result<Vec<u8>, BlobError> {
        self.fetches.set(self.fetches.get() + 1);
        tokio::task::yield_now().await;
        if self.unavailable.get() {
            return Err(BlobError::Download(format!("{url}: blob store unavailable")));
        }
        self.blobs
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_downloads_share_one_fetch() {
        let cache = BlobCache::new(MemoryBlobs::new());
        let url = cache.put(b"avatar".to_vec()).await.unwrap();

        let (a, b) = futures::join!(cache.get(&url), cache.get(&url));
        assert_eq!(a.unwrap().as_slice(), b"avatar");
        assert_eq!(b.unwrap().as_slice(), b"avatar");
        assert_eq!(cache.store().fetches(), 1);

        cache.get(&url).await.unwrap();
        assert_eq!(cache.store().fetches(), 1);

        assert!(cache.evict(&url));
        cache.get(&url).await.unwrap();
        assert_eq!(cache.store().fetches(), 2);
    }

    #[tokio::test]
    async fn missing_blobs_are_not_cached() {
        let cache = BlobCache::new(MemoryBlobs::new());
        let missing = cache.get("memory://blob/9").await;
        assert_eq!(
            missing,
            Err(BlobError::NotFound("memory://blob/9".to_string()))
        );
        assert!(!cache.evict("memory://blob/9"));
    }

    #[tokio::test]
    async fn failed_download_is_retried_on_next_get() {
        let cache = BlobCache::new(MemoryBlobs::new());
        let url = cache.put(b"doc".to_vec()).await.unwrap();

        cache.store().set_available(false);
        assert!(matches!(cache.get(&url).await, Err(BlobError::Download(_))));
        assert!(matches!(
            cache.put(b"more".to_vec()).await,
            Err(BlobError::Upload(_))
        ));

        cache.store().set_available(true);
        assert_eq!(cache.get(&url).await.unwrap().as_slice(), b"doc");
        assert_eq!(cache.store().fetches(), 2);
    }
}
