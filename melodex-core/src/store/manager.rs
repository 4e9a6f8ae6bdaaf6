//! Persistence manager: the engine's single owner of medium state.
//!
//! The manager is a synchronous state machine. It receives one message at
//! a time, mutates its owned state, and returns the effects the runtime
//! must perform: spawn a reader, command the writer, start an extraction,
//! publish an output, emit an event. It never spawns, sends, or awaits
//! itself, which keeps every scheduling rule (reader bound, one
//! extraction at a time, report-once, finalize-once) testable without a
//! runtime.
//!
//! Per-medium flow: a submitted medium with a persisted metadata file
//! gets a reader; resolution is judged against the scan listing when the
//! reader terminates. Files the persisted records did not cover go to
//! extraction, with the writer primed first so freshly extracted records
//! land on disk. A medium without a persisted file skips the reader and
//! reports immediately. Either way the medium finalizes exactly once,
//! with a summary and a completion event.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use melodex_model::{
    MediumChecksum, MediumListing, MetadataRecord, ScanId, WorkerId,
};
use melodex_model::reports::{MediumSummary, UnresolvedFilesReport};
use melodex_model::scan::ScanResult;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::events::{EngineEventPayload, EngineOutput, RecordBatch, RecordOrigin};
use crate::error::{MetadataError, Result};
use crate::extract::supervisor::{ExtractionAssignment, ExtractionEvent};
use crate::store::checksum::compute_medium_checksum;
use crate::store::reader::{ReadRequest, ReaderEvent, ReaderOutcome};
use crate::store::writer::{WriterCommand, WriterEvent};

/// Messages the manager consumes. The runtime translates every channel it
/// listens on into one of these.
#[derive(Debug)]
pub enum ManagerMessage {
    /// A completed directory scan arrived from the outside.
    Submit(ScanResult),
    /// The startup scan of the metadata directory finished.
    ArchiveScanned(Result<HashMap<MediumChecksum, PathBuf>>),
    Reader(ReaderEvent),
    Writer(WriterEvent),
    Extraction(ExtractionEvent),
    /// Reply with a snapshot of the in-memory library.
    Snapshot(oneshot::Sender<LibrarySnapshot>),
    Shutdown,
}

/// Effects the runtime performs on the manager's behalf, in order.
#[derive(Debug)]
pub enum ManagerEffect {
    SpawnReader(ReadRequest),
    Writer(WriterCommand),
    StartExtraction(ExtractionAssignment),
    Output(EngineOutput),
    Emit {
        scan_id: Option<ScanId>,
        medium_uri: Option<String>,
        payload: EngineEventPayload,
    },
    /// Cancel all running workers. Issued once, at shutdown.
    CancelWorkers,
    /// Everything is drained and the writer has acknowledged shutdown.
    ShutdownReady,
}

/// Point-in-time copy of the accumulated library.
#[derive(Debug, Clone)]
pub struct LibrarySnapshot {
    /// Finalized records per medium URI.
    pub media: HashMap<String, Vec<MetadataRecord>>,
    /// Media still being processed, sorted for determinism.
    pub in_progress: Vec<String>,
}

/// Progress of one in-flight medium.
#[derive(Debug)]
struct MediumProgress {
    scan_id: ScanId,
    listing: MediumListing,
    checksum: MediumChecksum,
    target: PathBuf,
    /// All listing URIs, precomputed once.
    uris: BTreeSet<String>,
    /// URIs with a non-empty record so far.
    resolved: BTreeSet<String>,
    reader: Option<WorkerId>,
    /// Non-empty records accumulated for the library.
    staged: Vec<MetadataRecord>,
    reader_done: bool,
    extraction_pending: bool,
    writer_pending: bool,
    records_written: usize,
    write_error: Option<String>,
}

impl MediumProgress {
    fn uri(&self) -> &str {
        &self.listing.identity.uri
    }

    fn report(&self) -> UnresolvedFilesReport {
        UnresolvedFilesReport::with_resolved(
            self.scan_id,
            self.listing.clone(),
            self.resolved.clone(),
        )
    }

    fn summary(&self) -> MediumSummary {
        MediumSummary {
            scan_id: self.scan_id,
            medium_uri: self.uri().to_string(),
            total_files: self.uris.len(),
            resolved: self.resolved.len(),
            unresolved: self.uris.len() - self.resolved.len(),
            records_written: self.records_written,
        }
    }

    /// Listing entries without a resolving record.
    fn remainder(&self) -> Vec<melodex_model::FileDescriptor> {
        self.listing
            .files
            .iter()
            .filter(|file| !self.resolved.contains(&self.listing.file_uri(&file.path)))
            .cloned()
            .collect()
    }
}

/// Owned, single-threaded state behind the whole engine.
#[derive(Debug)]
pub struct PersistenceManager {
    config: EngineConfig,
    archive: HashMap<MediumChecksum, PathBuf>,
    archive_ready: bool,
    /// Scans submitted before the archive scan finished.
    queued_scans: VecDeque<ScanResult>,
    /// Known media waiting for a reader slot, FIFO.
    pending_reads: VecDeque<String>,
    /// Media waiting for the single extraction slot, FIFO.
    pending_extractions: VecDeque<String>,
    active_extraction: Option<String>,
    media: HashMap<String, MediumProgress>,
    reader_index: HashMap<WorkerId, String>,
    library: HashMap<String, Vec<MetadataRecord>>,
    shutting_down: bool,
    writer_shutdown_sent: bool,
}

impl PersistenceManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            archive: HashMap::new(),
            archive_ready: false,
            queued_scans: VecDeque::new(),
            pending_reads: VecDeque::new(),
            pending_extractions: VecDeque::new(),
            active_extraction: None,
            media: HashMap::new(),
            reader_index: HashMap::new(),
            library: HashMap::new(),
            shutting_down: false,
            writer_shutdown_sent: false,
        }
    }

    /// Applies one message and returns the effects to perform, in order.
    pub fn handle(&mut self, message: ManagerMessage) -> Vec<ManagerEffect> {
        match message {
            ManagerMessage::Submit(scan) => self.on_submit(scan),
            ManagerMessage::ArchiveScanned(result) => self.on_archive_scanned(result),
            ManagerMessage::Reader(event) => self.on_reader(event),
            ManagerMessage::Writer(event) => self.on_writer(event),
            ManagerMessage::Extraction(event) => self.on_extraction(event),
            ManagerMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                Vec::new()
            }
            ManagerMessage::Shutdown => self.on_shutdown(),
        }
    }

    pub fn snapshot(&self) -> LibrarySnapshot {
        let mut in_progress: Vec<String> = self.media.keys().cloned().collect();
        in_progress.sort();
        LibrarySnapshot {
            media: self.library.clone(),
            in_progress,
        }
    }

    fn on_submit(&mut self, scan: ScanResult) -> Vec<ManagerEffect> {
        if self.shutting_down {
            warn!(
                target: "store::manager",
                scan_id = %scan.scan_id,
                media = scan.medium_count(),
                "scan rejected, engine is shutting down"
            );
            return Vec::new();
        }
        if !self.archive_ready {
            info!(
                target: "store::manager",
                scan_id = %scan.scan_id,
                media = scan.medium_count(),
                "archive scan still running, scan queued"
            );
            self.queued_scans.push_back(scan);
            return Vec::new();
        }
        self.admit_scan(scan)
    }

    fn admit_scan(&mut self, scan: ScanResult) -> Vec<ManagerEffect> {
        let mut effects = Vec::new();
        info!(
            target: "store::manager",
            scan_id = %scan.scan_id,
            media = scan.medium_count(),
            files = scan.file_count(),
            "scan admitted"
        );
        for listing in scan.media {
            self.admit_medium(scan.scan_id, listing, &mut effects);
        }
        self.pump_readers(&mut effects);
        self.pump_extractions(&mut effects);
        effects
    }

    fn admit_medium(
        &mut self,
        scan_id: ScanId,
        listing: MediumListing,
        effects: &mut Vec<ManagerEffect>,
    ) {
        let uri = listing.identity.uri.clone();
        if self.media.contains_key(&uri) {
            warn!(
                target: "store::manager",
                medium = %uri,
                "medium already in flight, skipping duplicate"
            );
            return;
        }

        if listing.files.is_empty() {
            // Nothing to resolve, persist, or extract.
            info!(target: "store::manager", medium = %uri, "empty medium, completing immediately");
            let report = UnresolvedFilesReport::new(scan_id, listing);
            let summary = MediumSummary {
                scan_id,
                medium_uri: uri.clone(),
                total_files: 0,
                resolved: 0,
                unresolved: 0,
                records_written: 0,
            };
            effects.push(emit(
                Some(scan_id),
                Some(&uri),
                EngineEventPayload::MediumQueued {
                    files: 0,
                    known: false,
                },
            ));
            effects.push(ManagerEffect::Output(EngineOutput::Unresolved(report)));
            effects.push(emit(
                Some(scan_id),
                Some(&uri),
                EngineEventPayload::UnresolvedReported {
                    total_files: 0,
                    resolved: 0,
                },
            ));
            effects.push(ManagerEffect::Output(EngineOutput::Summary(summary.clone())));
            effects.push(emit(
                Some(scan_id),
                Some(&uri),
                EngineEventPayload::MediumCompleted { summary },
            ));
            return;
        }

        let checksum = compute_medium_checksum(&listing);
        if let Some(other) = self
            .media
            .values()
            .find(|progress| progress.checksum == checksum)
        {
            warn!(
                target: "store::manager",
                medium = %uri,
                duplicate_of = %other.uri(),
                checksum = %checksum,
                "identical medium already in flight, skipping"
            );
            return;
        }

        let known_target = self.archive.get(&checksum).cloned();
        let known = known_target.is_some();
        debug!(
            target: "store::manager",
            medium = %uri,
            checksum = %checksum,
            files = listing.files.len(),
            known,
            "medium admitted"
        );
        effects.push(emit(
            Some(scan_id),
            Some(&uri),
            EngineEventPayload::MediumQueued {
                files: listing.files.len(),
                known,
            },
        ));

        let uris: BTreeSet<String> = listing
            .files
            .iter()
            .map(|file| listing.file_uri(&file.path))
            .collect();
        let target = known_target.unwrap_or_else(|| {
            self.config
                .metadata_dir
                .join(format!("{checksum}.{}", crate::store::scan::METADATA_EXTENSION))
        });
        let mut progress = MediumProgress {
            scan_id,
            listing,
            checksum,
            target,
            uris,
            resolved: BTreeSet::new(),
            reader: None,
            staged: Vec::new(),
            reader_done: false,
            extraction_pending: false,
            writer_pending: false,
            records_written: 0,
            write_error: None,
        };

        if known {
            self.pending_reads.push_back(uri.clone());
        } else {
            // No persisted metadata: everything is unresolved up front.
            progress.reader_done = true;
            effects.push(ManagerEffect::Output(EngineOutput::Unresolved(
                progress.report(),
            )));
            effects.push(emit(
                Some(scan_id),
                Some(&uri),
                EngineEventPayload::UnresolvedReported {
                    total_files: progress.uris.len(),
                    resolved: 0,
                },
            ));
            progress.writer_pending = true;
            effects.push(ManagerEffect::Writer(WriterCommand::ProcessMedium {
                scan_id,
                checksum: progress.checksum.clone(),
                target: progress.target.clone(),
                medium: progress.listing.identity.clone(),
                mapping: progress.listing.uri_path_mapping(),
                resolved_count: 0,
            }));
            progress.extraction_pending = true;
            self.pending_extractions.push_back(uri.clone());
        }
        self.media.insert(uri, progress);
    }

    fn on_archive_scanned(
        &mut self,
        result: Result<HashMap<MediumChecksum, PathBuf>>,
    ) -> Vec<ManagerEffect> {
        match result {
            Ok(mapping) => {
                info!(
                    target: "store::manager",
                    known_media = mapping.len(),
                    "archive ready"
                );
                self.archive = mapping;
            }
            Err(e) => {
                warn!(
                    target: "store::manager",
                    error = %e,
                    "archive scan failed, treating every medium as unknown"
                );
                self.archive = HashMap::new();
            }
        }
        self.archive_ready = true;

        let mut effects = Vec::new();
        let queued: Vec<ScanResult> = self.queued_scans.drain(..).collect();
        for scan in queued {
            effects.extend(self.admit_scan(scan));
        }
        effects
    }

    fn on_reader(&mut self, event: ReaderEvent) -> Vec<ManagerEffect> {
        match event {
            ReaderEvent::Records { worker, records } => self.on_reader_records(worker, records),
            ReaderEvent::Finished { worker, outcome } => self.on_reader_finished(worker, outcome),
        }
    }

    fn on_reader_records(
        &mut self,
        worker: WorkerId,
        records: Vec<MetadataRecord>,
    ) -> Vec<ManagerEffect> {
        let Some(uri) = self.reader_index.get(&worker).cloned() else {
            warn!(
                target: "store::manager",
                worker = %worker,
                count = records.len(),
                "records from unknown worker dropped"
            );
            return Vec::new();
        };
        let Some(progress) = self.media.get_mut(&uri) else {
            warn!(target: "store::manager", medium = %uri, "records for finalized medium dropped");
            return Vec::new();
        };

        for record in &records {
            if !record.is_empty() && progress.uris.contains(&record.uri) {
                progress.resolved.insert(record.uri.clone());
                progress.staged.push(record.clone());
            }
        }

        let count = records.len();
        let scan_id = progress.scan_id;
        vec![
            ManagerEffect::Output(EngineOutput::Records(RecordBatch {
                scan_id,
                medium_uri: uri.clone(),
                origin: RecordOrigin::PersistedFile,
                records,
            })),
            emit(
                Some(scan_id),
                Some(&uri),
                EngineEventPayload::RecordsPublished {
                    count,
                    origin: RecordOrigin::PersistedFile,
                },
            ),
        ]
    }

    fn on_reader_finished(
        &mut self,
        worker: WorkerId,
        outcome: ReaderOutcome,
    ) -> Vec<ManagerEffect> {
        let Some(uri) = self.reader_index.remove(&worker) else {
            warn!(
                target: "store::manager",
                worker = %worker,
                "terminal event from unknown worker dropped"
            );
            return Vec::new();
        };
        let mut effects = Vec::new();
        let Some(progress) = self.media.get_mut(&uri) else {
            warn!(target: "store::manager", medium = %uri, "terminal event for finalized medium dropped");
            self.pump_readers(&mut effects);
            return effects;
        };
        progress.reader = None;
        progress.reader_done = true;

        match &outcome {
            ReaderOutcome::Completed { published, skipped } => {
                debug!(
                    target: "store::manager",
                    medium = %uri,
                    worker = %worker,
                    published,
                    skipped,
                    "reader completed"
                );
            }
            ReaderOutcome::Failed { error, published } => match error {
                MetadataError::Cancelled(reason) => {
                    info!(
                        target: "store::manager",
                        medium = %uri,
                        worker = %worker,
                        %reason,
                        "reader cancelled"
                    );
                }
                MetadataError::Io(e) => {
                    warn!(
                        target: "store::manager",
                        medium = %uri,
                        worker = %worker,
                        published,
                        error = %e,
                        "reader failed, unread files go to extraction"
                    );
                }
                other => {
                    warn!(
                        target: "store::manager",
                        medium = %uri,
                        worker = %worker,
                        published,
                        error = %other,
                        "reader failed, unread files go to extraction"
                    );
                }
            },
            ReaderOutcome::Crashed { message } => {
                error!(
                    target: "store::manager",
                    medium = %uri,
                    worker = %worker,
                    error = %message,
                    "reader crashed, freed slot serves the next pending medium"
                );
            }
        }

        // The one resolution report for a known medium.
        let scan_id = progress.scan_id;
        let report = progress.report();
        let resolved = report.resolved_count();
        let total = report.total_files();
        effects.push(ManagerEffect::Output(EngineOutput::Unresolved(report)));
        effects.push(emit(
            Some(scan_id),
            Some(&uri),
            EngineEventPayload::UnresolvedReported {
                total_files: total,
                resolved,
            },
        ));

        if progress.resolved.len() == progress.uris.len() {
            // Persisted records covered everything; no writer, no
            // extraction.
            effects.extend(self.finalize_medium(&uri));
        } else if self.shutting_down {
            effects.extend(self.finalize_medium(&uri));
        } else {
            progress.writer_pending = true;
            effects.push(ManagerEffect::Writer(WriterCommand::ProcessMedium {
                scan_id,
                checksum: progress.checksum.clone(),
                target: progress.target.clone(),
                medium: progress.listing.identity.clone(),
                mapping: progress.listing.uri_path_mapping(),
                resolved_count: progress.resolved.len(),
            }));
            progress.extraction_pending = true;
            self.pending_extractions.push_back(uri.clone());
            self.pump_extractions(&mut effects);
        }

        self.pump_readers(&mut effects);
        effects
    }

    fn on_writer(&mut self, event: WriterEvent) -> Vec<ManagerEffect> {
        match event {
            WriterEvent::MediumPersisted {
                medium_uri,
                checksum,
                target,
                records_written,
                write_error,
                ..
            } => {
                // The archive learns the medium either way; partial files
                // are recovered on the next scan through the normal
                // resolution path.
                self.archive.insert(checksum, target);
                let mut effects = Vec::new();
                match self.media.get_mut(&medium_uri) {
                    Some(progress) => {
                        progress.writer_pending = false;
                        progress.records_written = records_written;
                        progress.write_error = write_error;
                        effects.extend(self.maybe_finalize(&medium_uri));
                    }
                    None => {
                        debug!(
                            target: "store::manager",
                            medium = %medium_uri,
                            "late persistence report for finalized medium"
                        );
                        self.check_drained(&mut effects);
                    }
                }
                effects
            }
            WriterEvent::ShutdownComplete => {
                if !self.shutting_down {
                    warn!(target: "store::manager", "unexpected writer shutdown acknowledgement");
                    return Vec::new();
                }
                info!(target: "store::manager", "writer drained, engine shutdown complete");
                vec![
                    emit(None, None, EngineEventPayload::ShutdownComplete),
                    ManagerEffect::ShutdownReady,
                ]
            }
        }
    }

    fn on_extraction(&mut self, event: ExtractionEvent) -> Vec<ManagerEffect> {
        match event {
            ExtractionEvent::FileExtracted { medium_uri, record } => {
                self.on_file_extracted(medium_uri, record)
            }
            ExtractionEvent::MediumExtracted {
                medium_uri,
                extracted,
                failed,
                aborted,
            } => self.on_medium_extracted(medium_uri, extracted, failed, aborted),
        }
    }

    fn on_file_extracted(
        &mut self,
        medium_uri: String,
        record: MetadataRecord,
    ) -> Vec<ManagerEffect> {
        let Some(progress) = self.media.get_mut(&medium_uri) else {
            warn!(
                target: "store::manager",
                medium = %medium_uri,
                uri = %record.uri,
                "extracted record for finalized medium dropped"
            );
            return Vec::new();
        };

        if !record.is_empty() && progress.uris.contains(&record.uri) {
            progress.resolved.insert(record.uri.clone());
            progress.staged.push(record.clone());
        }

        let mut effects = Vec::new();
        // The writer counts every extracted record, empty ones included.
        if progress.writer_pending {
            effects.push(ManagerEffect::Writer(WriterCommand::Append {
                medium_uri: medium_uri.clone(),
                record: record.clone(),
            }));
        }
        let scan_id = progress.scan_id;
        effects.push(ManagerEffect::Output(EngineOutput::Records(RecordBatch {
            scan_id,
            medium_uri: medium_uri.clone(),
            origin: RecordOrigin::Extraction,
            records: vec![record],
        })));
        effects.push(emit(
            Some(scan_id),
            Some(&medium_uri),
            EngineEventPayload::RecordsPublished {
                count: 1,
                origin: RecordOrigin::Extraction,
            },
        ));
        effects
    }

    fn on_medium_extracted(
        &mut self,
        medium_uri: String,
        extracted: usize,
        failed: usize,
        aborted: usize,
    ) -> Vec<ManagerEffect> {
        if self.active_extraction.as_deref() == Some(medium_uri.as_str()) {
            self.active_extraction = None;
        } else {
            warn!(
                target: "store::manager",
                medium = %medium_uri,
                "extraction completion for a medium that is not active"
            );
        }

        let mut effects = Vec::new();
        match self.media.get_mut(&medium_uri) {
            Some(progress) => {
                debug!(
                    target: "store::manager",
                    medium = %medium_uri,
                    extracted,
                    failed,
                    aborted,
                    "extraction finished"
                );
                progress.extraction_pending = false;
                effects.extend(self.maybe_finalize(&medium_uri));
            }
            None => {
                debug!(
                    target: "store::manager",
                    medium = %medium_uri,
                    "late extraction completion for finalized medium"
                );
                self.check_drained(&mut effects);
            }
        }
        self.pump_extractions(&mut effects);
        effects
    }

    fn on_shutdown(&mut self) -> Vec<ManagerEffect> {
        if self.shutting_down {
            warn!(target: "store::manager", "duplicate shutdown request ignored");
            return Vec::new();
        }
        self.shutting_down = true;
        info!(
            target: "store::manager",
            active_readers = self.reader_index.len(),
            pending_reads = self.pending_reads.len(),
            pending_extractions = self.pending_extractions.len(),
            queued_scans = self.queued_scans.len(),
            "shutdown started"
        );

        let mut effects = vec![ManagerEffect::CancelWorkers];

        // Media that never got a reader: report with nothing resolved and
        // finalize. Media with an active reader drain through the reader's
        // cancellation outcome instead.
        let waiting: Vec<String> = self.pending_reads.drain(..).collect();
        for uri in waiting {
            if let Some(progress) = self.media.get_mut(&uri) {
                progress.reader_done = true;
                let scan_id = progress.scan_id;
                let report = progress.report();
                let total = report.total_files();
                effects.push(ManagerEffect::Output(EngineOutput::Unresolved(report)));
                effects.push(emit(
                    Some(scan_id),
                    Some(&uri),
                    EngineEventPayload::UnresolvedReported {
                        total_files: total,
                        resolved: 0,
                    },
                ));
                effects.extend(self.finalize_medium(&uri));
            }
        }

        // Media waiting for the extraction slot already reported; release
        // them from the writer countdown and finalize. The active
        // extraction drains through its abort completion.
        let waiting: Vec<String> = self.pending_extractions.drain(..).collect();
        for uri in waiting {
            if let Some(progress) = self.media.get_mut(&uri) {
                progress.extraction_pending = false;
                progress.writer_pending = false;
                effects.extend(self.maybe_finalize(&uri));
            }
        }

        // Scans the archive scan never released: report and summarize
        // without admitting them.
        let queued: Vec<ScanResult> = self.queued_scans.drain(..).collect();
        for scan in queued {
            for listing in scan.media {
                let uri = listing.identity.uri.clone();
                let total = listing.files.len();
                let report = UnresolvedFilesReport::new(scan.scan_id, listing);
                let summary = MediumSummary {
                    scan_id: scan.scan_id,
                    medium_uri: uri.clone(),
                    total_files: total,
                    resolved: 0,
                    unresolved: total,
                    records_written: 0,
                };
                effects.push(ManagerEffect::Output(EngineOutput::Unresolved(report)));
                effects.push(emit(
                    Some(scan.scan_id),
                    Some(&uri),
                    EngineEventPayload::UnresolvedReported {
                        total_files: total,
                        resolved: 0,
                    },
                ));
                effects.push(ManagerEffect::Output(EngineOutput::Summary(summary.clone())));
                effects.push(emit(
                    Some(scan.scan_id),
                    Some(&uri),
                    EngineEventPayload::MediumCompleted { summary },
                ));
            }
        }

        self.check_drained(&mut effects);
        effects
    }

    /// Finalizes when nothing is left in flight for the medium. During
    /// shutdown the writer countdown no longer blocks completion.
    fn maybe_finalize(&mut self, uri: &str) -> Vec<ManagerEffect> {
        let ready = self.media.get(uri).is_some_and(|progress| {
            progress.reader_done
                && !progress.extraction_pending
                && (!progress.writer_pending || self.shutting_down)
        });
        if ready {
            self.finalize_medium(uri)
        } else {
            Vec::new()
        }
    }

    fn finalize_medium(&mut self, uri: &str) -> Vec<ManagerEffect> {
        let Some(progress) = self.media.remove(uri) else {
            return Vec::new();
        };
        let summary = progress.summary();
        info!(
            target: "store::manager",
            medium = %uri,
            total = summary.total_files,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            written = summary.records_written,
            "medium finalized"
        );
        // Replace, never merge: a rescan supersedes older records.
        self.library.insert(uri.to_string(), progress.staged);

        let mut effects = vec![ManagerEffect::Output(EngineOutput::Summary(summary.clone()))];
        match progress.write_error {
            Some(message) => {
                error!(
                    target: "store::manager",
                    medium = %uri,
                    error = %message,
                    "medium finished with a persistence failure"
                );
                effects.push(emit(
                    Some(summary.scan_id),
                    Some(uri),
                    EngineEventPayload::MediumFailed { summary, message },
                ));
            }
            None => {
                effects.push(emit(
                    Some(summary.scan_id),
                    Some(uri),
                    EngineEventPayload::MediumCompleted { summary },
                ));
            }
        }
        if self.shutting_down {
            self.check_drained(&mut effects);
        }
        effects
    }

    /// Assigns readers to waiting media up to the parallel bound.
    fn pump_readers(&mut self, effects: &mut Vec<ManagerEffect>) {
        if self.shutting_down {
            return;
        }
        while self.reader_index.len() < self.config.parallel_count
            && let Some(uri) = self.pending_reads.pop_front()
        {
            let Some(progress) = self.media.get_mut(&uri) else {
                continue;
            };
            let worker = WorkerId::new();
            progress.reader = Some(worker);
            self.reader_index.insert(worker, uri.clone());
            effects.push(emit(
                Some(progress.scan_id),
                Some(&uri),
                EngineEventPayload::ReaderStarted {
                    worker,
                    file: progress.target.clone(),
                },
            ));
            effects.push(ManagerEffect::SpawnReader(ReadRequest {
                worker,
                scan_id: progress.scan_id,
                medium: progress.listing.identity.clone(),
                target: progress.target.clone(),
                read_chunk_size: self.config.read_chunk_size,
                max_message_size: self.config.max_message_size,
            }));
        }
    }

    /// Starts the next queued extraction. Extraction media are strictly
    /// serialized: at most one supervisor runs at a time.
    fn pump_extractions(&mut self, effects: &mut Vec<ManagerEffect>) {
        if self.shutting_down || self.active_extraction.is_some() {
            return;
        }
        while let Some(uri) = self.pending_extractions.pop_front() {
            let Some(progress) = self.media.get_mut(&uri) else {
                continue;
            };
            let files = progress.remainder();
            if files.is_empty() {
                // Everything resolved while the medium waited in line.
                progress.extraction_pending = false;
                effects.extend(self.maybe_finalize(&uri));
                continue;
            }
            info!(
                target: "store::manager",
                medium = %uri,
                files = files.len(),
                "extraction started"
            );
            self.active_extraction = Some(uri.clone());
            effects.push(ManagerEffect::StartExtraction(ExtractionAssignment {
                scan_id: progress.scan_id,
                medium: progress.listing.identity.clone(),
                root: progress.listing.root.clone(),
                files,
            }));
            break;
        }
    }

    /// During shutdown, asks the writer to stop once nothing else can
    /// produce appends.
    fn check_drained(&mut self, effects: &mut Vec<ManagerEffect>) {
        if self.shutting_down
            && !self.writer_shutdown_sent
            && self.media.is_empty()
            && self.reader_index.is_empty()
            && self.active_extraction.is_none()
        {
            self.writer_shutdown_sent = true;
            effects.push(ManagerEffect::Writer(WriterCommand::Shutdown));
        }
    }
}

fn emit(
    scan_id: Option<ScanId>,
    medium_uri: Option<&str>,
    payload: EngineEventPayload,
) -> ManagerEffect {
    ManagerEffect::Emit {
        scan_id,
        medium_uri: medium_uri.map(str::to_string),
        payload,
    }
}
