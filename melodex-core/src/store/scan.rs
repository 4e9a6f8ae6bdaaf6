//! Startup scan of the persisted-metadata directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use melodex_model::MediumChecksum;
use tokio::fs;

use crate::error::{MetadataError, Result};

/// Extension of persisted metadata files. One file per medium checksum.
pub const METADATA_EXTENSION: &str = "mdt";

/// Single-pass scan of `dir` for persisted metadata files, keyed by the
/// checksum their name carries. Files without the `.mdt` extension are
/// ignored. An empty or missing mapping is not an error; an unlistable
/// directory is, and the caller downgrades that to "no persisted files".
pub async fn scan_metadata_dir(
    dir: &Path,
) -> Result<HashMap<MediumChecksum, PathBuf>> {
    let mut mapping = HashMap::new();

    let mut entries = fs::read_dir(dir).await.map_err(|e| {
        MetadataError::Io(std::io::Error::other(format!(
            "Failed to read metadata directory {}: {}",
            dir.display(),
            e
        )))
    })?;

    let mut faults = StreamFaults::new();
    while let Some(entry_res) = entries.next_entry().await.transpose() {
        let entry = match entry_res {
            Ok(ent) => {
                faults.succeeded();
                ent
            }
            Err(e) => {
                if faults.failed() {
                    return Err(MetadataError::Io(std::io::Error::other(
                        format!(
                            "Giving up on metadata directory {} after repeated read failures: {}",
                            dir.display(),
                            e
                        ),
                    )));
                }
                tracing::warn!(target: "store::scan", path = %dir.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };

        let path = entry.path();
        let is_metadata_file = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(METADATA_EXTENSION));
        if !is_metadata_file {
            continue;
        }

        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(target: "store::scan", entry = %path.display(), error = %e, "skipping entry due to file type error");
                continue;
            }
        }

        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
        else {
            tracing::warn!(target: "store::scan", entry = %path.display(), "skipping metadata file with undecodable name");
            continue;
        };

        tracing::debug!(target: "store::scan", checksum = %stem, file = %path.display(), "persisted metadata file found");
        mapping.insert(MediumChecksum::new(stem), path);
    }

    tracing::info!(target: "store::scan", dir = %dir.display(), known_media = mapping.len(), "metadata directory scanned");
    Ok(mapping)
}

/// Tolerance for a flaky directory stream. A single bad entry is skipped;
/// a second failure in a row means the stream itself is broken and the
/// scan must stop instead of spinning on the same handle.
struct StreamFaults {
    consecutive: u32,
}

impl StreamFaults {
    const LIMIT: u32 = 2;

    fn new() -> Self {
        Self { consecutive: 0 }
    }

    /// Records a failure; true when the stream should be abandoned.
    fn failed(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= Self::LIMIT
    }

    fn succeeded(&mut self) {
        self.consecutive = 0;
    }
}
