use chrono::{DateTime, Utc};

use crate::files::MediumListing;
use crate::ids::ScanId;

/// One completed directory scan: every medium discovered under a scan
/// root with its file listing. Produced by the external scanner, consumed
/// once by the engine, then discarded. Media keep their discovery order;
/// reader assignment is FIFO over it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanResult {
    pub scan_id: ScanId,
    pub discovered_at: DateTime<Utc>,
    pub media: Vec<MediumListing>,
}

impl ScanResult {
    pub fn new(media: Vec<MediumListing>) -> Self {
        Self {
            scan_id: ScanId::new(),
            discovered_at: Utc::now(),
            media,
        }
    }

    pub fn medium_count(&self) -> usize {
        self.media.len()
    }

    pub fn file_count(&self) -> usize {
        self.media.iter().map(|listing| listing.files.len()).sum()
    }
}
