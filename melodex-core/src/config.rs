use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MetadataError, Result};

/// Fixed envelope allowance added on top of one read chunk when deriving
/// the smallest usable `max_message_size`. A published record batch must be
/// able to carry everything parsed out of a single chunk.
pub const MESSAGE_OVERHEAD: usize = 512;

/// Tuning knobs for the metadata engine. All sizes are bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes read per file-read call, for both persisted-metadata readers
    /// and audio extraction readers. Larger chunks mean fewer, bigger
    /// record batches.
    pub read_chunk_size: usize,

    /// Upper bound on the ID3v2 tag prefix the tag processor buffers.
    /// Tags larger than this (typically embedded cover art) are parsed up
    /// to the limit only.
    pub tag_size_limit: usize,

    /// Maximum reader workers active at once. Applies globally to
    /// persisted-metadata readers across all media, and per medium to
    /// extraction readers.
    pub parallel_count: usize,

    /// Completed records buffered per medium before the writer appends
    /// them in one flush.
    pub write_batch_size: usize,

    /// Ceiling on a published record batch and on the parser's
    /// carried-over partial record. Clamped up to
    /// `read_chunk_size + MESSAGE_OVERHEAD` when configured smaller.
    pub max_message_size: usize,

    /// Directory holding the persisted `.mdt` metadata files. Created on
    /// first write if absent.
    pub metadata_dir: PathBuf,

    /// How long `shutdown()` waits for in-flight workers before aborting
    /// them.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 16 * 1024,
            tag_size_limit: 256 * 1024,
            parallel_count: 4,
            write_batch_size: 32,
            max_message_size: 64 * 1024,
            metadata_dir: PathBuf::from("metadata"),
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Non-fatal validation finding, e.g. a clamped value. Callers decide how
/// to surface these; the engine builder logs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNote {
    pub message: String,
    pub hint: Option<String>,
}

impl ConfigNote {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    fn with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

impl EngineConfig {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            ..Self::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validates the configuration, repairing what can be repaired.
    ///
    /// Zero sizes/counts and an empty metadata directory are fatal. An
    /// undersized `max_message_size` is clamped to
    /// `read_chunk_size + MESSAGE_OVERHEAD` and reported as a note.
    pub fn validate(&mut self) -> Result<Vec<ConfigNote>> {
        if self.read_chunk_size == 0 {
            return Err(MetadataError::Config(
                "read_chunk_size must be greater than zero".into(),
            ));
        }
        if self.tag_size_limit == 0 {
            return Err(MetadataError::Config(
                "tag_size_limit must be greater than zero".into(),
            ));
        }
        if self.parallel_count == 0 {
            return Err(MetadataError::Config(
                "parallel_count must be greater than zero".into(),
            ));
        }
        if self.write_batch_size == 0 {
            return Err(MetadataError::Config(
                "write_batch_size must be greater than zero".into(),
            ));
        }
        if self.metadata_dir.as_os_str().is_empty() {
            return Err(MetadataError::Config(
                "metadata_dir must not be empty".into(),
            ));
        }

        let mut notes = Vec::new();

        let min_message_size = self.read_chunk_size + MESSAGE_OVERHEAD;
        if self.max_message_size < min_message_size {
            notes.push(ConfigNote::with_hint(
                format!(
                    "max_message_size {} is below read_chunk_size + {}; clamped to {}",
                    self.max_message_size, MESSAGE_OVERHEAD, min_message_size
                ),
                "raise max_message_size or lower read_chunk_size",
            ));
            self.max_message_size = min_message_size;
        }

        if self.tag_size_limit < 1024 {
            notes.push(ConfigNote::new(format!(
                "tag_size_limit {} is small; typical ID3v2 text frames need a few KiB",
                self.tag_size_limit
            )));
        }

        Ok(notes)
    }
}
