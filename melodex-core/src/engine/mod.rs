//! The runtime wrapper around the persistence manager.
//!
//! [`MetadataEngine`] is the public face of the crate: build it, submit
//! scan results, consume the output stream, subscribe to lifecycle
//! events, shut it down. Everything underneath (manager task, writer
//! task, reader and extraction workers) is private.

pub mod events;
mod runtime;

pub use events::{
    EngineEvent, EngineEventPayload, EngineOutput, EventMeta, RecordBatch,
    RecordOrigin,
};
pub use runtime::{EngineHandle, MetadataEngine, MetadataEngineBuilder};
