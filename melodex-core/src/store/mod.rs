//! The persisted metadata store.
//!
//! One `.mdt` file per medium checksum, line-delimited JSON records,
//! append-only. [`scan`] locates existing files at startup, [`codec`]
//! reads and writes the format, [`reader`] and [`writer`] are the worker
//! tasks moving records in and out, and [`manager`] owns all medium
//! state and scheduling.

pub mod checksum;
pub mod codec;
pub mod manager;
pub mod reader;
pub mod scan;
pub mod writer;

pub use checksum::compute_medium_checksum;
pub use manager::{LibrarySnapshot, PersistenceManager};
pub use scan::{METADATA_EXTENSION, scan_metadata_dir};
