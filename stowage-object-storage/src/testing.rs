//! Object store with injected faults, for exercising destinations that misbehave.

use std::{fmt::Display, sync::Arc, time::Duration};

use futures::stream::BoxStream;
use object_store::{
    memory::InMemory, path::Path, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta,
    ObjectStore, PutMultipartOpts, PutOptions, PutPayload, PutResult,
};

/// Wraps another store. Writes to keys ending in a rejected suffix fail, reads of keys
/// containing a slowed fragment are delayed.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    rejected_puts: Vec<String>,
    slow_reads: Vec<(String, Duration)>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            rejected_puts: Vec::new(),
            slow_reads: Vec::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn reject_puts_to(mut self, suffix: &str) -> Self {
        self.rejected_puts.push(suffix.to_string());
        self
    }

    pub fn delay_reads_of(mut self, fragment: &str, delay: Duration) -> Self {
        self.slow_reads.push((fragment.to_string(), delay));
        self
    }
}

impl Display for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FaultyStore({})", self.inner)
    }
}

#[async_trait::async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        if self
            .rejected_puts
            .iter()
            .any(|suffix| location.as_ref().ends_with(suffix.as_str()))
        {
            return Err(object_store::Error::Generic {
                store: "FaultyStore",
                source: format!("write to {location} rejected").into(),
            });
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        for (fragment, delay) in &self.slow_reads {
            if location.as_ref().contains(fragment.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
