use std::collections::BTreeSet;

use crate::files::{FileDescriptor, MediumListing};
use crate::ids::ScanId;

/// Outcome report for one medium: the full scan-time file list alongside
/// the subset that resolved. Sent exactly once per medium-processing
/// outcome, even when nothing is unresolved; never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnresolvedFilesReport {
    pub scan_id: ScanId,
    pub listing: MediumListing,
    /// Medium-relative URIs that produced a metadata record this pass.
    pub resolved: BTreeSet<String>,
}

impl UnresolvedFilesReport {
    pub fn new(scan_id: ScanId, listing: MediumListing) -> Self {
        Self {
            scan_id,
            listing,
            resolved: BTreeSet::new(),
        }
    }

    pub fn with_resolved(
        scan_id: ScanId,
        listing: MediumListing,
        resolved: BTreeSet<String>,
    ) -> Self {
        Self {
            scan_id,
            listing,
            resolved,
        }
    }

    /// Files of the listing whose URI did not resolve. Together with
    /// `resolved` this always covers the scan-time file list exactly.
    pub fn unresolved(&self) -> Vec<&FileDescriptor> {
        self.listing
            .files
            .iter()
            .filter(|file| {
                !self.resolved.contains(&self.listing.file_uri(&file.path))
            })
            .collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().len()
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    pub fn total_files(&self) -> usize {
        self.listing.files.len()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.unresolved_count() == 0
    }
}

/// Terminal per-medium summary exposed to callers once a medium leaves
/// in-progress tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediumSummary {
    pub scan_id: ScanId,
    pub medium_uri: String,
    pub total_files: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub records_written: usize,
}
