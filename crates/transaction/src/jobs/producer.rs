//! Chunked id producers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ChunkConfig;
use crate::core::{IdPageQuery, ResourceStore};
use crate::error::{JobError, StorageResult};
use crate::types::{ChunkSelection, IdPage, ResumeMarker};

/// Produces bounded, ordered pages of resource ids.
#[async_trait]
pub trait IdChunkProducer: Send + Sync {
    /// Returns the page following `marker`, or the first page without one.
    ///
    /// An empty page with no marker means the selection is exhausted.
    async fn next_id_page(
        &self,
        selection: &ChunkSelection,
        marker: Option<&ResumeMarker>,
        page_size: usize,
    ) -> StorageResult<IdPage>;
}

#[async_trait]
impl<P: IdChunkProducer + ?Sized> IdChunkProducer for Arc<P> {
    async fn next_id_page(
        &self,
        selection: &ChunkSelection,
        marker: Option<&ResumeMarker>,
        page_size: usize,
    ) -> StorageResult<IdPage> {
        (**self).next_id_page(selection, marker, page_size).await
    }
}

/// Store-backed producer walking ids in ascending persistent id order.
///
/// Used by reindex and other batch jobs that visit every selected resource.
#[derive(Debug)]
pub struct ReindexIdChunkProducer<S> {
    store: Arc<S>,
    config: ChunkConfig,
}

impl<S: ResourceStore> ReindexIdChunkProducer<S> {
    /// Creates a producer over a store.
    pub fn new(store: Arc<S>, config: ChunkConfig) -> Self {
        Self { store, config }
    }

    /// Paging limits.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }
}

#[async_trait]
impl<S: ResourceStore> IdChunkProducer for ReindexIdChunkProducer<S> {
    async fn next_id_page(
        &self,
        selection: &ChunkSelection,
        marker: Option<&ResumeMarker>,
        page_size: usize,
    ) -> StorageResult<IdPage> {
        if page_size == 0 {
            return Err(JobError::InvalidPageSize {
                requested: page_size,
                max: self.config.max_page_size,
            }
            .into());
        }
        let page_size = if page_size > self.config.max_page_size {
            debug!(
                requested = page_size,
                max = self.config.max_page_size,
                "Clamped id page size"
            );
            self.config.max_page_size
        } else {
            page_size
        };

        let query = IdPageQuery {
            selection,
            after: marker.map(ResumeMarker::last_pid),
            limit: page_size,
        };
        let ids = self.store.fetch_id_page(query).await?;
        debug!(
            backend = self.store.backend_name(),
            after = ?marker.map(ResumeMarker::last_pid),
            ids = ids.len(),
            "Produced id page"
        );
        Ok(IdPage::from_ids(ids))
    }
}
