//! Engine construction and the runtime loop.
//!
//! The runtime loop is the single place where the synchronous
//! [`PersistenceManager`] meets the async world: it merges every worker
//! channel into one message at a time, applies it, and performs the
//! returned effects. Workers are launched through injected factories so
//! tests can drive the loop without disk or real tasks.

use std::sync::{Arc, Mutex};

use melodex_model::scan::ScanResult;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::events::{EngineEvent, EngineEventPayload, EngineOutput, EventMeta};
use crate::error::{MetadataError, Result};
use crate::extract::processor::ExtractionWorkerFactory;
use crate::extract::supervisor::{ExtractionEvent, run_medium_supervisor};
use crate::extract::TokioExtractionFactory;
use crate::store::manager::{
    LibrarySnapshot, ManagerEffect, ManagerMessage, PersistenceManager,
};
use crate::store::reader::{FsReaderFactory, ReaderEvent, ReaderWorkerFactory};
use crate::store::scan::scan_metadata_dir;
use crate::store::writer::{WriterCommand, WriterEvent, run_writer};

const COMMAND_MAILBOX_CAPACITY: usize = 256;
const WORKER_CHANNEL_CAPACITY: usize = 256;

/// Configures and validates a [`MetadataEngine`].
#[derive(Debug)]
pub struct MetadataEngineBuilder {
    config: EngineConfig,
    reader_factory: Arc<dyn ReaderWorkerFactory>,
    extraction_factory: Arc<dyn ExtractionWorkerFactory>,
    event_capacity: usize,
    output_capacity: usize,
}

impl MetadataEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            reader_factory: Arc::new(FsReaderFactory),
            extraction_factory: Arc::new(TokioExtractionFactory),
            event_capacity: 256,
            output_capacity: 256,
        }
    }

    /// Replaces the factory that launches persisted-file readers.
    pub fn with_reader_factory(
        mut self,
        factory: Arc<dyn ReaderWorkerFactory>,
    ) -> Self {
        self.reader_factory = factory;
        self
    }

    /// Replaces the factory that launches extraction worker trios.
    pub fn with_extraction_factory(
        mut self,
        factory: Arc<dyn ExtractionWorkerFactory>,
    ) -> Self {
        self.extraction_factory = factory;
        self
    }

    /// Capacity of the lossy broadcast event channel.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Capacity of the lossless output stream. A full stream backpressures
    /// the engine, not the submitters.
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Validates the configuration and assembles the engine. Repairable
    /// findings are logged; invalid values fail here, before anything
    /// runs.
    pub fn build(mut self) -> Result<MetadataEngine> {
        let notes = self.config.validate()?;
        for note in &notes {
            match &note.hint {
                Some(hint) => {
                    warn!(target: "engine", message = %note.message, %hint, "config note")
                }
                None => warn!(target: "engine", message = %note.message, "config note"),
            }
        }
        Ok(MetadataEngine {
            config: self.config,
            reader_factory: self.reader_factory,
            extraction_factory: self.extraction_factory,
            event_capacity: self.event_capacity,
            output_capacity: self.output_capacity,
        })
    }
}

/// A validated, not-yet-running engine.
#[derive(Debug)]
pub struct MetadataEngine {
    config: EngineConfig,
    reader_factory: Arc<dyn ReaderWorkerFactory>,
    extraction_factory: Arc<dyn ExtractionWorkerFactory>,
    event_capacity: usize,
    output_capacity: usize,
}

impl MetadataEngine {
    pub fn builder(config: EngineConfig) -> MetadataEngineBuilder {
        MetadataEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the manager loop, the writer task and the startup archive
    /// scan, and returns the handle everything else goes through.
    pub fn start(self) -> EngineHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_MAILBOX_CAPACITY);
        let (reader_tx, reader_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (writer_cmd_tx, writer_cmd_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (writer_event_tx, writer_event_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (extraction_tx, extraction_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(self.output_capacity);
        let (events_tx, _) = broadcast::channel(self.event_capacity);
        let (archive_tx, archive_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(run_writer(
            writer_cmd_rx,
            writer_event_tx,
            self.config.write_batch_size,
        ));

        let metadata_dir = self.config.metadata_dir.clone();
        tokio::spawn(async move {
            let result = scan_metadata_dir(&metadata_dir).await;
            let _ = archive_tx.send(result);
        });

        let loop_state = RuntimeLoop {
            manager: PersistenceManager::new(self.config.clone()),
            config: self.config.clone(),
            reader_factory: self.reader_factory,
            extraction_factory: self.extraction_factory,
            reader_tx,
            writer_cmd_tx,
            extraction_tx,
            output_tx,
            events_tx: events_tx.clone(),
            cancel: CancellationToken::new(),
            sequence: 0,
            done_tx,
        };
        let runtime = tokio::spawn(loop_state.run(
            commands_rx,
            reader_rx,
            writer_event_rx,
            extraction_rx,
            archive_rx,
        ));
        info!(
            target: "engine",
            metadata_dir = %self.config.metadata_dir.display(),
            parallel_count = self.config.parallel_count,
            "engine started"
        );

        EngineHandle {
            config: self.config,
            commands: commands_tx,
            events: events_tx,
            outputs: Mutex::new(Some(output_rx)),
            done: done_rx,
            runtime: Mutex::new(Some(runtime)),
        }
    }
}

/// Running engine. Cloneable observers come from [`subscribe`]; the
/// lossless output stream is taken once via [`records`].
///
/// [`subscribe`]: EngineHandle::subscribe
/// [`records`]: EngineHandle::records
#[derive(Debug)]
pub struct EngineHandle {
    config: EngineConfig,
    commands: mpsc::Sender<ManagerMessage>,
    events: broadcast::Sender<EngineEvent>,
    outputs: Mutex<Option<mpsc::Receiver<EngineOutput>>>,
    done: watch::Receiver<bool>,
    runtime: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submits a completed directory scan. Listings are checked against
    /// their roots up front; accepted scans are fire-and-forget, results
    /// come back through the output stream and events.
    pub async fn submit_scan(&self, scan: ScanResult) -> Result<()> {
        validate_scan(&scan)?;
        self.commands
            .send(ManagerMessage::Submit(scan))
            .await
            .map_err(|_| MetadataError::Cancelled("engine stopped".into()))
    }

    /// Observes lifecycle events. Lossy under lag, like any broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Takes the lossless output stream (records, reports, summaries).
    /// There is exactly one; a second call finds it gone.
    pub fn records(&self) -> Result<mpsc::Receiver<EngineOutput>> {
        self.outputs
            .lock()
            .expect("outputs lock poisoned")
            .take()
            .ok_or_else(|| {
                MetadataError::NotFound(
                    "engine output stream already taken".into(),
                )
            })
    }

    /// Point-in-time copy of the accumulated library.
    pub async fn snapshot(&self) -> Result<LibrarySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ManagerMessage::Snapshot(tx))
            .await
            .map_err(|_| MetadataError::Cancelled("engine stopped".into()))?;
        rx.await
            .map_err(|_| MetadataError::Cancelled("engine stopped".into()))
    }

    /// Two-phase shutdown: request, then wait for the drain
    /// acknowledgment. Workers that outlive the configured timeout are
    /// aborted.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(ManagerMessage::Shutdown)
            .await
            .map_err(|_| MetadataError::Cancelled("engine stopped".into()))?;

        let mut done = self.done.clone();
        let acknowledged = tokio::time::timeout(
            self.config.shutdown_timeout(),
            done.wait_for(|done| *done),
        )
        .await;

        let runtime = self
            .runtime
            .lock()
            .expect("runtime lock poisoned")
            .take();
        match acknowledged {
            Ok(Ok(_)) => {
                if let Some(handle) = runtime {
                    let _ = handle.await;
                }
                Ok(())
            }
            Ok(Err(_)) => Err(MetadataError::Internal(
                "engine runtime stopped without acknowledging shutdown".into(),
            )),
            Err(_) => {
                warn!(
                    target: "engine",
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "shutdown timed out, aborting remaining workers"
                );
                if let Some(handle) = runtime {
                    handle.abort();
                }
                Err(MetadataError::Cancelled(format!(
                    "shutdown timed out after {}ms",
                    self.config.shutdown_timeout_ms
                )))
            }
        }
    }
}

/// Every file of a listing must sit beneath the listing's root; anything
/// else would checksum and resolve under a name unrelated to the medium.
fn validate_scan(scan: &ScanResult) -> Result<()> {
    for listing in &scan.media {
        for file in &listing.files {
            if file.path.strip_prefix(&listing.root).is_err() {
                return Err(MetadataError::InvalidMedium(format!(
                    "{}: file {} is outside the medium root {}",
                    listing.identity,
                    file.path.display(),
                    listing.root.display()
                )));
            }
        }
    }
    Ok(())
}

/// The single task that owns the manager.
struct RuntimeLoop {
    manager: PersistenceManager,
    config: EngineConfig,
    reader_factory: Arc<dyn ReaderWorkerFactory>,
    extraction_factory: Arc<dyn ExtractionWorkerFactory>,
    reader_tx: mpsc::Sender<ReaderEvent>,
    writer_cmd_tx: mpsc::Sender<WriterCommand>,
    extraction_tx: mpsc::Sender<ExtractionEvent>,
    output_tx: mpsc::Sender<EngineOutput>,
    events_tx: broadcast::Sender<EngineEvent>,
    cancel: CancellationToken,
    sequence: u64,
    done_tx: watch::Sender<bool>,
}

impl RuntimeLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ManagerMessage>,
        mut reader_events: mpsc::Receiver<ReaderEvent>,
        mut writer_events: mpsc::Receiver<WriterEvent>,
        mut extraction_events: mpsc::Receiver<ExtractionEvent>,
        mut archive: oneshot::Receiver<
            Result<std::collections::HashMap<
                melodex_model::MediumChecksum,
                std::path::PathBuf,
            >>,
        >,
    ) {
        let mut commands_open = true;
        let mut archive_pending = true;
        loop {
            let message = tokio::select! {
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => command,
                        None => {
                            // Every handle is gone: drain as if shutdown
                            // had been requested.
                            commands_open = false;
                            debug!(target: "engine", "command channel closed, draining");
                            ManagerMessage::Shutdown
                        }
                    }
                }
                result = &mut archive, if archive_pending => {
                    archive_pending = false;
                    ManagerMessage::ArchiveScanned(result.unwrap_or_else(|_| {
                        Err(MetadataError::Internal(
                            "archive scan task dropped".into(),
                        ))
                    }))
                }
                Some(event) = reader_events.recv() => ManagerMessage::Reader(event),
                Some(event) = writer_events.recv() => ManagerMessage::Writer(event),
                Some(event) = extraction_events.recv() => ManagerMessage::Extraction(event),
                else => break,
            };

            let effects = self.manager.handle(message);
            if self.perform(effects).await {
                break;
            }
        }
        let _ = self.done_tx.send(true);
        debug!(target: "engine", "runtime loop ended");
    }

    /// Performs effects in order. Returns true once the manager reports
    /// the drain complete.
    async fn perform(&mut self, effects: Vec<ManagerEffect>) -> bool {
        let mut ready = false;
        for effect in effects {
            match effect {
                ManagerEffect::SpawnReader(request) => {
                    self.reader_factory.spawn_reader(
                        request,
                        self.reader_tx.clone(),
                        self.cancel.child_token(),
                    );
                }
                ManagerEffect::Writer(command) => {
                    let _ = self.writer_cmd_tx.send(command).await;
                }
                ManagerEffect::StartExtraction(assignment) => {
                    tokio::spawn(run_medium_supervisor(
                        assignment,
                        self.config.clone(),
                        Arc::clone(&self.extraction_factory),
                        self.extraction_tx.clone(),
                        self.cancel.child_token(),
                    ));
                }
                ManagerEffect::Output(output) => {
                    let _ = self.output_tx.send(output).await;
                }
                ManagerEffect::Emit {
                    scan_id,
                    medium_uri,
                    payload,
                } => {
                    self.emit(scan_id, medium_uri, payload);
                }
                ManagerEffect::CancelWorkers => {
                    self.cancel.cancel();
                }
                ManagerEffect::ShutdownReady => {
                    ready = true;
                }
            }
        }
        ready
    }

    fn emit(
        &mut self,
        scan_id: Option<melodex_model::ScanId>,
        medium_uri: Option<String>,
        payload: EngineEventPayload,
    ) {
        self.sequence += 1;
        let event = EngineEvent {
            meta: EventMeta {
                sequence: self.sequence,
                occurred_at: chrono::Utc::now(),
                scan_id,
                medium_uri,
            },
            payload,
        };
        let _ = self.events_tx.send(event);
    }
}
