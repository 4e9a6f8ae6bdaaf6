//! Order-independent medium fingerprinting.
//!
//! The checksum keys the persisted metadata file for a medium, so it must
//! be stable across rescans: same file set, same checksum, regardless of
//! listing order or where the medium happens to be mounted.

use melodex_model::{MediumChecksum, MediumListing};
use sha2::{Digest, Sha256};

/// Hash contribution of one file: medium-relative URI plus size.
/// Modification times are deliberately excluded so an untouched medium
/// relocates the same metadata file after remounting or copying.
fn hash_input(uri: &str, size: u64) -> String {
    format!("{uri}:{size}")
}

/// Compute the deterministic checksum of a medium's file set.
pub fn compute_medium_checksum(listing: &MediumListing) -> MediumChecksum {
    let mut entries: Vec<(String, u64)> = listing
        .files
        .iter()
        .map(|file| (listing.file_uri(&file.path), file.size))
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (uri, size) in &entries {
        hasher.update(hash_input(uri, *size).as_bytes());
        hasher.update(b"\n");
    }

    MediumChecksum::new(format!("{:x}", hasher.finalize()))
}
