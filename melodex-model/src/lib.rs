//! Core data model definitions shared across Melodex crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod files;
pub mod ids;
pub mod records;
pub mod reports;
pub mod scan;

// Intentionally curated re-exports for downstream consumers.
pub use files::{FileDescriptor, MediumIdentity, MediumListing, relative_uri};
pub use ids::{MediumChecksum, ScanId, WorkerId};
pub use records::MetadataRecord;
pub use reports::{MediumSummary, UnresolvedFilesReport};
pub use scan::ScanResult;
