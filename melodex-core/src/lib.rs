//! Metadata extraction and persistence engine for the Melodex media
//! indexer.
//!
//! The engine takes completed directory scans, matches each medium
//! against its persisted `.mdt` metadata file, streams known records
//! back through bounded reader workers, extracts tags and audio-frame
//! data for everything else, and appends the freshly extracted records
//! in batches. See [`engine::MetadataEngine`] for the entry point.
#![allow(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod store;

pub use config::{ConfigNote, EngineConfig, MESSAGE_OVERHEAD};
pub use engine::{
    EngineEvent, EngineEventPayload, EngineHandle, EngineOutput, MetadataEngine,
    MetadataEngineBuilder, RecordBatch, RecordOrigin,
};
pub use error::{MetadataError, Result};

// Model types downstream crates need alongside the engine.
pub use melodex_model::{
    FileDescriptor, MediumChecksum, MediumIdentity, MediumListing,
    MediumSummary, MetadataRecord, ScanId, ScanResult, UnresolvedFilesReport,
    WorkerId,
};
