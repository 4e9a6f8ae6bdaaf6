//! Engine event and output payloads.
//!
//! Two channels leave the engine: a lossless mpsc stream of
//! [`EngineOutput`] values (records, reports, summaries — the data
//! collaborators consume) and a lossy broadcast of [`EngineEvent`]
//! lifecycle notifications for observers that only want to watch.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use melodex_model::{
    MediumSummary, MetadataRecord, ScanId, UnresolvedFilesReport, WorkerId,
};
use serde::{Deserialize, Serialize};

/// Envelope attached to every broadcast engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Monotonic per-engine sequence, assigned at publish time.
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub scan_id: Option<ScanId>,
    pub medium_uri: Option<String>,
}

/// Lifecycle transitions observable on the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEventPayload {
    /// A scanned medium was admitted: `known` media head for a reader,
    /// unknown ones for extraction.
    MediumQueued { files: usize, known: bool },
    ReaderStarted { worker: WorkerId, file: PathBuf },
    RecordsPublished { count: usize, origin: RecordOrigin },
    UnresolvedReported { total_files: usize, resolved: usize },
    MediumCompleted { summary: MediumSummary },
    MediumFailed { summary: MediumSummary, message: String },
    ShutdownComplete,
}

/// Fully qualified engine event with metadata and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub meta: EventMeta,
    pub payload: EngineEventPayload,
}

/// Where a published record batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOrigin {
    /// Parsed out of an existing `.mdt` file by a reader worker.
    PersistedFile,
    /// Freshly extracted from the audio files themselves.
    Extraction,
}

/// One batch of per-file records attributed to a medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBatch {
    pub scan_id: ScanId,
    pub medium_uri: String,
    pub origin: RecordOrigin,
    pub records: Vec<MetadataRecord>,
}

/// Payloads delivered on the engine's lossless output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineOutput {
    Records(RecordBatch),
    Unresolved(UnresolvedFilesReport),
    Summary(MediumSummary),
}

impl EngineOutput {
    /// Medium this payload belongs to, for routing and display.
    pub fn medium_uri(&self) -> &str {
        match self {
            EngineOutput::Records(batch) => &batch.medium_uri,
            EngineOutput::Unresolved(report) => &report.listing.identity.uri,
            EngineOutput::Summary(summary) => &summary.medium_uri,
        }
    }
}
