//! Lazy page sequence over a producer.

use crate::error::StorageResult;
use crate::types::{ChunkSelection, IdPage, ResumeMarker};

use super::producer::IdChunkProducer;

/// Forward cursor over the pages of one selection.
///
/// Each call to [`next_page`](Self::next_page) issues at most one store query.
/// Stopping between calls leaves nothing behind; [`marker`](Self::marker) is
/// all a job needs to checkpoint.
pub struct IdPageCursor<'a, P: ?Sized> {
    producer: &'a P,
    selection: ChunkSelection,
    marker: Option<ResumeMarker>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, P: IdChunkProducer + ?Sized> IdPageCursor<'a, P> {
    /// Starts at the beginning of the selection.
    pub fn new(producer: &'a P, selection: ChunkSelection, page_size: usize) -> Self {
        Self {
            producer,
            selection,
            marker: None,
            page_size,
            exhausted: false,
        }
    }

    /// Continues after a checkpointed marker.
    pub fn resume_from(mut self, marker: Option<ResumeMarker>) -> Self {
        self.marker = marker;
        self
    }

    /// Marker of the last page handed out.
    pub fn marker(&self) -> Option<&ResumeMarker> {
        self.marker.as_ref()
    }

    /// Returns true once the producer signalled the end.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The next non-empty page, or `None` once the selection is exhausted.
    pub async fn next_page(&mut self) -> StorageResult<Option<IdPage>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .producer
            .next_id_page(&self.selection, self.marker.as_ref(), self.page_size)
            .await?;
        if page.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }
        self.marker = page.marker.clone();
        Ok(Some(page))
    }
}
