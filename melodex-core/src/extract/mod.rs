//! Metadata extraction from audio files.
//!
//! Extraction is organized per medium: a supervisor keeps a bounded set
//! of files in flight, each file served by a reader/processor worker trio
//! whose partial results a collector merges into one record. Scanners for
//! the two metadata sources, ID3 tags and MPEG frame headers, live in
//! [`id3`] and [`frames`].

pub mod collector;
pub mod frames;
pub mod id3;
pub mod processor;
pub mod supervisor;

pub use processor::{ExtractionWorkerFactory, TokioExtractionFactory};
pub use supervisor::{ExtractionAssignment, ExtractionEvent, run_medium_supervisor};
