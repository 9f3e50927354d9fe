//! The id-list step of a batch job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ChunkConfig;
use crate::error::{JobError, StorageResult};
use crate::types::{ChunkSelection, ResumeMarker, TypedPersistentId};

use super::cursor::IdPageCursor;
use super::producer::IdChunkProducer;

/// Parameters of one id-list run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdListDetails {
    /// Which resources to visit.
    #[serde(default)]
    pub selection: ChunkSelection,

    /// Page size; the step's default when absent.
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Encoded marker to resume after.
    #[serde(default)]
    pub resume_marker: Option<String>,

    /// Instant the job started. Resources updated later are not selected.
    pub job_started: DateTime<Utc>,
}

impl IdListDetails {
    /// A run over `selection` starting now.
    pub fn new(selection: ChunkSelection) -> Self {
        Self {
            selection,
            page_size: None,
            resume_marker: None,
            job_started: Utc::now(),
        }
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Resumes after an encoded marker.
    pub fn resuming(mut self, marker: impl Into<String>) -> Self {
        self.resume_marker = Some(marker.into());
        self
    }

    /// Sets the job start instant.
    pub fn started_at(mut self, job_started: DateTime<Utc>) -> Self {
        self.job_started = job_started;
        self
    }
}

/// One page handed to the downstream step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkChunk {
    /// Position of the page within this run, from 0.
    pub sequence: usize,
    /// The ids of the page.
    pub ids: Vec<TypedPersistentId>,
    /// Encoded marker to resume after this page.
    pub resume_marker: Option<String>,
}

/// Receives work chunks.
#[async_trait]
pub trait IdChunkSink: Send {
    /// Accepts one chunk.
    async fn accept(&mut self, chunk: WorkChunk) -> Result<(), JobError>;
}

#[async_trait]
impl IdChunkSink for Vec<WorkChunk> {
    async fn accept(&mut self, chunk: WorkChunk) -> Result<(), JobError> {
        self.push(chunk);
        Ok(())
    }
}

/// Sink forwarding chunks over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<WorkChunk>,
}

impl ChannelSink {
    /// Creates a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorkChunk>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl IdChunkSink for ChannelSink {
    async fn accept(&mut self, chunk: WorkChunk) -> Result<(), JobError> {
        let page = chunk.sequence;
        self.sender
            .send(chunk)
            .await
            .map_err(|e| JobError::SinkRejected {
                page,
                message: e.to_string(),
            })
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Ids handed downstream.
    pub ids: usize,
    /// Pages handed downstream.
    pub pages: usize,
    /// Marker after the last page, for checkpointing.
    pub last_marker: Option<String>,
}

/// Walks a selection and pushes every page into a sink.
#[derive(Debug)]
pub struct ResourceIdListStep<P> {
    producer: P,
    config: ChunkConfig,
}

impl<P: IdChunkProducer> ResourceIdListStep<P> {
    /// Creates a step.
    pub fn new(producer: P, config: ChunkConfig) -> Self {
        Self { producer, config }
    }

    /// Runs to completion.
    ///
    /// The selection is bounded by the job start instant so resources updated
    /// while the job runs are not picked up.
    pub async fn run<K: IdChunkSink>(
        &self,
        details: &IdListDetails,
        sink: &mut K,
    ) -> StorageResult<RunOutcome> {
        let marker = details
            .resume_marker
            .as_deref()
            .map(ResumeMarker::decode)
            .transpose()?;
        let page_size = details.page_size.unwrap_or(self.config.page_size);
        let selection = details.selection.clone().snapshot_at(details.job_started);

        let mut cursor = IdPageCursor::new(&self.producer, selection, page_size).resume_from(marker);
        let mut outcome = RunOutcome {
            last_marker: details.resume_marker.clone(),
            ..RunOutcome::default()
        };

        while let Some(page) = cursor.next_page().await? {
            let resume_marker = page.marker.as_ref().map(ResumeMarker::encode);
            let ids = page.len();
            sink.accept(WorkChunk {
                sequence: outcome.pages,
                ids: page.ids,
                resume_marker: resume_marker.clone(),
            })
            .await?;
            debug!(sequence = outcome.pages, ids, "Submitted work chunk");
            outcome.ids += ids;
            outcome.pages += 1;
            outcome.last_marker = resume_marker;
        }

        info!(ids = outcome.ids, pages = outcome.pages, "Id list step complete");
        Ok(outcome)
    }
}
