//! Append-only writer for persisted metadata files.
//!
//! One writer task serves every medium. Senders fire and forget; the only
//! backpressure is the writer's own mailbox. Records buffer in memory per
//! medium and are appended in batches of `write_batch_size`, with a final
//! flush when the medium's expected record count arrives. Write failures
//! are recorded and reported, never retried here.

use std::collections::HashMap;
use std::path::PathBuf;

use melodex_model::{
    MediumChecksum, MediumIdentity, MetadataRecord, ScanId,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::codec;

/// Commands accepted by the writer worker.
#[derive(Debug)]
pub enum WriterCommand {
    /// Announce a medium whose freshly extracted records will follow.
    /// `resolved_count` files already have persisted records, so the
    /// writer expects `mapping.len() - resolved_count` appends before the
    /// medium is complete.
    ProcessMedium {
        scan_id: ScanId,
        checksum: MediumChecksum,
        target: PathBuf,
        medium: MediumIdentity,
        mapping: HashMap<String, PathBuf>,
        resolved_count: usize,
    },
    /// One completed record for an announced medium.
    Append {
        medium_uri: String,
        record: MetadataRecord,
    },
    /// Flush everything buffered and stop.
    Shutdown,
}

/// Events the writer reports back to the manager.
#[derive(Debug)]
pub enum WriterEvent {
    /// Terminal event per announced medium: all expected records arrived
    /// and the final flush ran (successfully or not).
    MediumPersisted {
        scan_id: ScanId,
        medium_uri: String,
        checksum: MediumChecksum,
        target: PathBuf,
        records_written: usize,
        write_error: Option<String>,
    },
    /// Acknowledges `WriterCommand::Shutdown` after the last flush.
    ShutdownComplete,
}

struct MediumWriteState {
    scan_id: ScanId,
    checksum: MediumChecksum,
    target: PathBuf,
    mapping: HashMap<String, PathBuf>,
    expected: usize,
    received: usize,
    written: usize,
    buffer: Vec<MetadataRecord>,
    write_error: Option<String>,
}

impl MediumWriteState {
    async fn flush(&mut self, medium_uri: &str) {
        if self.buffer.is_empty() || self.write_error.is_some() {
            self.buffer.clear();
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        match append_batch(&self.target, &batch).await {
            Ok(()) => {
                self.written += batch.len();
                debug!(
                    target: "store::writer",
                    medium = %medium_uri,
                    file = %self.target.display(),
                    appended = batch.len(),
                    total = self.written,
                    "batch appended"
                );
            }
            Err(e) => {
                warn!(
                    target: "store::writer",
                    medium = %medium_uri,
                    file = %self.target.display(),
                    error = %e,
                    "append failed; further writes for this medium are dropped"
                );
                self.write_error = Some(e);
            }
        }
    }
}

async fn append_batch(
    target: &PathBuf,
    batch: &[MetadataRecord],
) -> Result<(), String> {
    let block = codec::encode_batch(batch).map_err(|e| e.to_string())?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| e.to_string())?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(target)
        .await
        .map_err(|e| e.to_string())?;
    file.write_all(block.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    file.flush().await.map_err(|e| e.to_string())
}

/// Writer worker loop. Runs until `Shutdown` or the command channel
/// closes.
pub async fn run_writer(
    mut commands: mpsc::Receiver<WriterCommand>,
    events: mpsc::Sender<WriterEvent>,
    write_batch_size: usize,
) {
    let mut media: HashMap<String, MediumWriteState> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::ProcessMedium {
                scan_id,
                checksum,
                target,
                medium,
                mapping,
                resolved_count,
            } => {
                let expected =
                    mapping.len().saturating_sub(resolved_count);
                info!(
                    target: "store::writer",
                    medium = %medium,
                    file = %target.display(),
                    expected,
                    "medium accepted for persistence"
                );
                let state = MediumWriteState {
                    scan_id,
                    checksum,
                    target,
                    mapping,
                    expected,
                    received: 0,
                    written: 0,
                    buffer: Vec::new(),
                    write_error: None,
                };
                if expected == 0 {
                    // Nothing to append; report completion straight away.
                    emit_persisted(&events, &medium.uri, state).await;
                } else {
                    media.insert(medium.uri.clone(), state);
                }
            }
            WriterCommand::Append { medium_uri, record } => {
                let Some(state) = media.get_mut(&medium_uri) else {
                    warn!(
                        target: "store::writer",
                        medium = %medium_uri,
                        uri = %record.uri,
                        "record for unannounced medium dropped"
                    );
                    continue;
                };
                if !state.mapping.contains_key(&record.uri) {
                    warn!(
                        target: "store::writer",
                        medium = %medium_uri,
                        uri = %record.uri,
                        "record outside the medium's file set dropped"
                    );
                    continue;
                }
                state.received += 1;
                state.buffer.push(record);
                if state.buffer.len() >= write_batch_size {
                    state.flush(&medium_uri).await;
                }
                if state.received >= state.expected
                    && let Some(mut state) = media.remove(&medium_uri)
                {
                    state.flush(&medium_uri).await;
                    emit_persisted(&events, &medium_uri, state).await;
                }
            }
            WriterCommand::Shutdown => {
                for (medium_uri, state) in media.iter_mut() {
                    if !state.buffer.is_empty() {
                        debug!(
                            target: "store::writer",
                            medium = %medium_uri,
                            buffered = state.buffer.len(),
                            "flushing partial buffer at shutdown"
                        );
                        state.flush(medium_uri).await;
                    }
                }
                let _ = events.send(WriterEvent::ShutdownComplete).await;
                break;
            }
        }
    }
    debug!(target: "store::writer", "writer stopped");
}

async fn emit_persisted(
    events: &mpsc::Sender<WriterEvent>,
    medium_uri: &str,
    state: MediumWriteState,
) {
    let _ = events
        .send(WriterEvent::MediumPersisted {
            scan_id: state.scan_id,
            medium_uri: medium_uri.to_string(),
            checksum: state.checksum,
            target: state.target,
            records_written: state.written,
            write_error: state.write_error,
        })
        .await;
}
