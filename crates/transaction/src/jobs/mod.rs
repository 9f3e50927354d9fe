//! Chunked id production for batch jobs.
//!
//! A batch job (reindex, expunge, export) first lists the ids it will visit.
//! The [`ResourceIdListStep`] walks a [`ChunkSelection`](crate::types::ChunkSelection)
//! through an [`IdChunkProducer`] and hands each bounded page to an
//! [`IdChunkSink`] as an independent [`WorkChunk`]. Pages are ordered by
//! persistent id and never overlap, so a run stopped between pages can resume
//! from the last [`ResumeMarker`](crate::types::ResumeMarker).

mod cursor;
mod producer;
mod step;

pub use cursor::IdPageCursor;
pub use producer::{IdChunkProducer, ReindexIdChunkProducer};
pub use step::{ChannelSink, IdChunkSink, IdListDetails, ResourceIdListStep, RunOutcome, WorkChunk};
