//! Reader workers for persisted metadata files.
//!
//! One worker reads one `.mdt` file end to end: Idle until the read
//! request arrives, Reading while chunks stream through the codec, then
//! Completed or Failed. Parsed batches are published as they close; on a
//! mid-read I/O error everything parsed so far has already been published
//! before the failure is signalled. A failed worker is never retried; the
//! parent assigns a fresh worker to the next pending medium instead.

use std::fmt;
use std::path::PathBuf;

use melodex_model::{MediumIdentity, MetadataRecord, ScanId, WorkerId};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MetadataError;
use crate::store::codec::{self, ParseState};

/// Everything a reader worker needs to process one medium's file.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub worker: WorkerId,
    pub scan_id: ScanId,
    pub medium: MediumIdentity,
    pub target: PathBuf,
    pub read_chunk_size: usize,
    pub max_message_size: usize,
}

/// Messages a reader worker publishes to its requester.
#[derive(Debug)]
pub enum ReaderEvent {
    /// A batch of records parsed from one chunk.
    Records {
        worker: WorkerId,
        records: Vec<MetadataRecord>,
    },
    /// Terminal state of the worker. Sent exactly once per spawned reader
    /// unless the task was torn down externally.
    Finished {
        worker: WorkerId,
        outcome: ReaderOutcome,
    },
}

/// Terminal state of one reader worker.
#[derive(Debug)]
pub enum ReaderOutcome {
    Completed { published: usize, skipped: usize },
    Failed {
        error: MetadataError,
        published: usize,
    },
    /// The worker task panicked. Reported by the spawn monitor, never by
    /// the worker itself.
    Crashed { message: String },
}

impl ReaderOutcome {
    pub fn published(&self) -> usize {
        match self {
            ReaderOutcome::Completed { published, .. }
            | ReaderOutcome::Failed { published, .. } => *published,
            ReaderOutcome::Crashed { .. } => 0,
        }
    }
}

/// Constructs and launches reader workers. The engine injects the real
/// filesystem factory; tests inject scripted ones to drive outcomes and
/// observe concurrency without touching disk.
pub trait ReaderWorkerFactory: Send + Sync + fmt::Debug {
    /// Spawn a reader for `request`, delivering its events to `events`.
    /// Fire-and-forget: the returned ID is the only handle the caller
    /// keeps.
    fn spawn_reader(
        &self,
        request: ReadRequest,
        events: mpsc::Sender<ReaderEvent>,
        cancel: CancellationToken,
    ) -> WorkerId;
}

/// Production factory: spawns a tokio task per read and a monitor that
/// converts a panicked task into a `Crashed` outcome so the parent always
/// observes a terminal state.
#[derive(Debug, Default, Clone)]
pub struct FsReaderFactory;

impl ReaderWorkerFactory for FsReaderFactory {
    fn spawn_reader(
        &self,
        request: ReadRequest,
        events: mpsc::Sender<ReaderEvent>,
        cancel: CancellationToken,
    ) -> WorkerId {
        let worker = request.worker;
        let monitor_events = events.clone();
        let task =
            tokio::spawn(run_reader(request, events, cancel));
        tokio::spawn(async move {
            if let Err(join_err) = task.await
                && join_err.is_panic()
            {
                let _ = monitor_events
                    .send(ReaderEvent::Finished {
                        worker,
                        outcome: ReaderOutcome::Crashed {
                            message: format!("reader task panicked: {join_err}"),
                        },
                    })
                    .await;
            }
        });
        worker
    }
}

/// Worker body. Publishes record batches per chunk and finishes with one
/// terminal event. Returning without sending `Finished` only happens when
/// the requester has gone away.
async fn run_reader(
    request: ReadRequest,
    events: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
) {
    let worker = request.worker;
    debug!(
        target: "store::reader",
        worker = %worker,
        medium = %request.medium,
        file = %request.target.display(),
        "reader starting"
    );

    let mut published = 0usize;
    let mut skipped = 0usize;

    let mut file = match File::open(&request.target).await {
        Ok(file) => file,
        Err(e) => {
            finish(
                &events,
                worker,
                ReaderOutcome::Failed {
                    error: MetadataError::Io(e),
                    published,
                },
            )
            .await;
            return;
        }
    };

    let mut state = ParseState::new();
    let mut buf = vec![0u8; request.read_chunk_size];

    loop {
        if cancel.is_cancelled() {
            finish(
                &events,
                worker,
                ReaderOutcome::Failed {
                    error: MetadataError::Cancelled(
                        "reader cancelled mid-file".into(),
                    ),
                    published,
                },
            )
            .await;
            return;
        }

        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                // Publish-then-fail: batches from earlier chunks are
                // already out; only the failure remains to report.
                finish(
                    &events,
                    worker,
                    ReaderOutcome::Failed {
                        error: MetadataError::Io(e),
                        published,
                    },
                )
                .await;
                return;
            }
        };
        let is_last = read == 0;

        let outcome = codec::process_chunk(
            &mut state,
            &buf[..read],
            &request.medium,
            is_last,
            request.max_message_size,
        );

        for fault in &outcome.faults {
            warn!(
                target: "store::reader",
                worker = %worker,
                file = %request.target.display(),
                line = fault.line,
                error = %fault.message,
                "skipping malformed record"
            );
        }
        skipped += outcome.faults.len();

        if !outcome.records.is_empty() {
            published += outcome.records.len();
            if events
                .send(ReaderEvent::Records {
                    worker,
                    records: outcome.records,
                })
                .await
                .is_err()
            {
                return;
            }
        }

        if let Some(fault) = outcome.terminal {
            finish(
                &events,
                worker,
                ReaderOutcome::Failed {
                    error: MetadataError::Internal(format!(
                        "unrecoverable metadata stream at line {}: {}",
                        fault.line, fault.message
                    )),
                    published,
                },
            )
            .await;
            return;
        }

        if is_last {
            if outcome.truncated_tail > 0 {
                debug!(
                    target: "store::reader",
                    worker = %worker,
                    file = %request.target.display(),
                    bytes = outcome.truncated_tail,
                    "incomplete final record left for a later read"
                );
            }
            finish(
                &events,
                worker,
                ReaderOutcome::Completed { published, skipped },
            )
            .await;
            return;
        }
    }
}

async fn finish(
    events: &mpsc::Sender<ReaderEvent>,
    worker: WorkerId,
    outcome: ReaderOutcome,
) {
    debug!(target: "store::reader", worker = %worker, outcome = ?outcome, "reader finished");
    let _ = events
        .send(ReaderEvent::Finished { worker, outcome })
        .await;
}
