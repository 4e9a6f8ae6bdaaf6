//! Per-medium extraction supervision.
//!
//! One supervisor serves one medium at a time. It keeps up to
//! `parallel_count` files in flight, each served by a reader/processor
//! trio, and folds worker messages into per-file collectors. A file that
//! fails or crashes is torn down and surfaces as an empty record; the
//! freed slot goes to the next pending file, never back to the failed
//! one. Completion is reported once, after the last in-flight file
//! settles or the medium is aborted.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use melodex_model::{FileDescriptor, MediumIdentity, MetadataRecord, ScanId, WorkerId, relative_uri};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::MetadataError;
use crate::extract::collector::CollectorMap;
use crate::extract::processor::{
    ExtractionWorkerFactory, ExtractorMessage, FileReadRequest, FileWorkerSet, ProcessorPool,
};

const WORKER_MAILBOX_CAPACITY: usize = 1024;

/// A medium's worth of extraction work: the files the persisted store
/// could not resolve.
#[derive(Debug, Clone)]
pub struct ExtractionAssignment {
    pub scan_id: ScanId,
    pub medium: MediumIdentity,
    pub root: PathBuf,
    pub files: Vec<FileDescriptor>,
}

/// Events a medium supervisor reports upward.
#[derive(Debug)]
pub enum ExtractionEvent {
    /// One file settled. The record may be empty when nothing could be
    /// extracted.
    FileExtracted {
        medium_uri: String,
        record: MetadataRecord,
    },
    /// The medium is done. Sent exactly once, also after an abort.
    MediumExtracted {
        medium_uri: String,
        extracted: usize,
        failed: usize,
        aborted: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorPhase {
    Idle,
    Scanning,
    Draining,
}

impl fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupervisorPhase::Idle => "idle",
            SupervisorPhase::Scanning => "scanning",
            SupervisorPhase::Draining => "draining",
        };
        f.write_str(label)
    }
}

/// State for one medium's extraction run.
struct MediumRun {
    medium_uri: String,
    root: PathBuf,
    parallel: usize,
    read_chunk_size: usize,
    tag_size_limit: usize,
    factory: Arc<dyn ExtractionWorkerFactory>,
    worker_tx: mpsc::Sender<ExtractorMessage>,
    cancel: CancellationToken,
    pending: VecDeque<FileDescriptor>,
    pool: ProcessorPool,
    collectors: CollectorMap,
    phase: SupervisorPhase,
    extracted: usize,
    failed: usize,
}

impl MediumRun {
    /// Tops the in-flight set up to the parallel bound, in listing order.
    fn assign_up_to_parallel(&mut self) {
        while self.collectors.len() < self.parallel
            && let Some(file) = self.pending.pop_front()
        {
            self.assign(file);
        }
        self.update_phase();
    }

    fn assign(&mut self, file: FileDescriptor) {
        let uri = relative_uri(&self.root, &file.path);
        self.collectors.get_or_create(&uri, file.size);

        let factory = &self.factory;
        let worker_tx = &self.worker_tx;
        let cancel = &self.cancel;
        let tag_size_limit = self.tag_size_limit;
        let read_chunk_size = self.read_chunk_size;
        let path = file.path;
        let set = self.pool.get_or_create(&uri, || {
            let tag = factory.spawn_tag_processor(uri.clone(), tag_size_limit, worker_tx.clone());
            let frames = factory.spawn_frame_processor(uri.clone(), worker_tx.clone());
            let reader = factory.spawn_file_reader(
                FileReadRequest {
                    worker: WorkerId::new(),
                    uri: uri.clone(),
                    path,
                    read_chunk_size,
                },
                vec![tag.chunks.clone(), frames.chunks.clone()],
                worker_tx.clone(),
                cancel.child_token(),
            );
            FileWorkerSet {
                reader,
                tag,
                frames,
            }
        });
        debug!(
            target: "extract::worker",
            uri = %uri,
            reader = %set.reader,
            "file assigned"
        );
    }

    /// Applies one worker message and returns any records now ready to
    /// publish. Messages for files no longer in flight are stale output
    /// of a torn-down trio and are dropped.
    fn handle(&mut self, msg: ExtractorMessage) -> Vec<MetadataRecord> {
        let mut out = Vec::new();
        match msg {
            ExtractorMessage::TagReady { uri, partial } => {
                match self.collectors.get_mut(&uri) {
                    Some(collector) => {
                        collector.merge_tag(partial);
                        self.complete_if_ready(&uri, &mut out);
                    }
                    None => {
                        debug!(target: "extract::collect", uri = %uri, "stale tag partial dropped")
                    }
                }
            }
            ExtractorMessage::FramesReady { uri, partial } => {
                match self.collectors.get_mut(&uri) {
                    Some(collector) => {
                        collector.merge_frames(partial);
                        self.complete_if_ready(&uri, &mut out);
                    }
                    None => {
                        debug!(target: "extract::collect", uri = %uri, "stale frame partial dropped")
                    }
                }
            }
            ExtractorMessage::ReadDone { uri, bytes } => {
                // Completion is driven by the partials, which follow the
                // last chunk on their own mailboxes.
                debug!(target: "extract::worker", uri = %uri, bytes, "file read complete");
            }
            ExtractorMessage::ReadFailed { uri, error } => {
                if self.collectors.contains(&uri) {
                    match &error {
                        MetadataError::Cancelled(reason) => {
                            info!(target: "extract::worker", uri = %uri, %reason, "file read cancelled")
                        }
                        MetadataError::Io(e) => {
                            warn!(target: "extract::worker", uri = %uri, error = %e, "file read failed")
                        }
                        other => {
                            warn!(target: "extract::worker", uri = %uri, error = %other, "file read failed")
                        }
                    }
                    out.extend(self.teardown(&uri));
                } else {
                    debug!(target: "extract::worker", uri = %uri, "stale read failure dropped");
                }
            }
            ExtractorMessage::Crashed { uri, role, message } => {
                if self.collectors.contains(&uri) {
                    error!(
                        target: "extract::worker",
                        uri = %uri,
                        role = %role,
                        error = %message,
                        "extraction worker crashed"
                    );
                    out.extend(self.teardown(&uri));
                } else {
                    debug!(target: "extract::worker", uri = %uri, "stale crash report dropped");
                }
            }
        }
        self.assign_up_to_parallel();
        out
    }

    fn complete_if_ready(&mut self, uri: &str, out: &mut Vec<MetadataRecord>) {
        let ready = self
            .collectors
            .get_mut(uri)
            .is_some_and(|collector| collector.is_complete());
        if ready && let Some(collector) = self.collectors.remove(uri) {
            self.pool.remove(uri);
            let record = collector.into_record(&self.medium_uri);
            if record.is_empty() {
                self.failed += 1;
            } else {
                self.extracted += 1;
            }
            debug!(
                target: "extract::collect",
                uri = %uri,
                resolved = !record.is_empty(),
                "file extraction complete"
            );
            out.push(record);
        }
    }

    /// Replacement, not resume: the file surfaces as an empty record and
    /// its slot goes to the next pending file. Partials already merged
    /// are discarded with the collector.
    fn teardown(&mut self, uri: &str) -> Option<MetadataRecord> {
        self.pool.remove(uri);
        let collector = self.collectors.remove(uri)?;
        let mut record = MetadataRecord::unresolved(collector.uri(), collector.size());
        record.medium = Some(self.medium_uri.clone());
        self.failed += 1;
        Some(record)
    }

    /// Tears everything down and returns how many files never settled.
    fn abort(&mut self) -> usize {
        let aborted = self.pending.len() + self.collectors.len();
        self.pending.clear();
        self.collectors.clear();
        self.pool.clear();
        self.update_phase();
        aborted
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.collectors.is_empty()
    }

    fn update_phase(&mut self) {
        let next = if self.pending.is_empty() && self.collectors.is_empty() {
            SupervisorPhase::Idle
        } else if self.pending.is_empty() {
            SupervisorPhase::Draining
        } else {
            SupervisorPhase::Scanning
        };
        if next != self.phase {
            debug!(
                target: "extract::worker",
                medium = %self.medium_uri,
                from = %self.phase,
                to = %next,
                "supervisor phase change"
            );
            self.phase = next;
        }
    }
}

/// Runs extraction for one medium to completion or abort.
pub async fn run_medium_supervisor(
    assignment: ExtractionAssignment,
    config: EngineConfig,
    factory: Arc<dyn ExtractionWorkerFactory>,
    events: mpsc::Sender<ExtractionEvent>,
    cancel: CancellationToken,
) {
    let medium_uri = assignment.medium.uri.clone();
    info!(
        target: "extract::worker",
        scan_id = %assignment.scan_id,
        medium = %assignment.medium,
        files = assignment.files.len(),
        "extraction starting"
    );

    let (worker_tx, mut worker_rx) = mpsc::channel(WORKER_MAILBOX_CAPACITY);
    let mut run = MediumRun {
        medium_uri: medium_uri.clone(),
        root: assignment.root,
        parallel: config.parallel_count.max(1),
        read_chunk_size: config.read_chunk_size,
        tag_size_limit: config.tag_size_limit,
        factory,
        worker_tx,
        cancel: cancel.clone(),
        pending: assignment.files.into(),
        pool: ProcessorPool::default(),
        collectors: CollectorMap::default(),
        phase: SupervisorPhase::Idle,
        extracted: 0,
        failed: 0,
    };
    run.assign_up_to_parallel();

    let mut aborted = 0usize;
    while !run.is_done() {
        tokio::select! {
            _ = cancel.cancelled() => {
                aborted = run.abort();
                warn!(
                    target: "extract::worker",
                    medium = %medium_uri,
                    aborted,
                    "extraction aborted"
                );
                break;
            }
            msg = worker_rx.recv() => {
                let Some(msg) = msg else { break };
                for record in run.handle(msg) {
                    let event = ExtractionEvent::FileExtracted {
                        medium_uri: medium_uri.clone(),
                        record,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    info!(
        target: "extract::collect",
        medium = %medium_uri,
        extracted = run.extracted,
        failed = run.failed,
        aborted,
        "extraction finished"
    );
    let _ = events
        .send(ExtractionEvent::MediumExtracted {
            medium_uri,
            extracted: run.extracted,
            failed: run.failed,
            aborted,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::extract::frames::FramePartial;
    use crate::extract::id3::TagPartial;
    use crate::extract::processor::{ProcessorHandle, TokioExtractionFactory};

    /// Factory that spawns nothing. It records reader spawns, notifies the
    /// test about each, and captures the worker message sender so the test
    /// can script worker behavior.
    #[derive(Debug)]
    struct ScriptedFactory {
        spawned: mpsc::UnboundedSender<String>,
        worker_tx: Mutex<Option<mpsc::Sender<ExtractorMessage>>>,
    }

    impl ScriptedFactory {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    spawned: tx,
                    worker_tx: Mutex::new(None),
                }),
                rx,
            )
        }

        fn capture(&self, events: &mpsc::Sender<ExtractorMessage>) {
            let mut slot = self.worker_tx.lock().unwrap();
            if slot.is_none() {
                *slot = Some(events.clone());
            }
        }

        fn worker_tx(&self) -> mpsc::Sender<ExtractorMessage> {
            self.worker_tx
                .lock()
                .unwrap()
                .clone()
                .expect("no worker spawned yet")
        }
    }

    impl ExtractionWorkerFactory for ScriptedFactory {
        fn spawn_file_reader(
            &self,
            request: FileReadRequest,
            _sinks: Vec<mpsc::Sender<crate::extract::processor::FileChunk>>,
            events: mpsc::Sender<ExtractorMessage>,
            _cancel: CancellationToken,
        ) -> WorkerId {
            self.capture(&events);
            let _ = self.spawned.send(request.uri);
            request.worker
        }

        fn spawn_tag_processor(
            &self,
            _uri: String,
            _tag_size_limit: usize,
            events: mpsc::Sender<ExtractorMessage>,
        ) -> ProcessorHandle {
            self.capture(&events);
            let (tx, _rx) = mpsc::channel(1);
            ProcessorHandle {
                worker: WorkerId::new(),
                chunks: tx,
            }
        }

        fn spawn_frame_processor(
            &self,
            _uri: String,
            events: mpsc::Sender<ExtractorMessage>,
        ) -> ProcessorHandle {
            self.capture(&events);
            let (tx, _rx) = mpsc::channel(1);
            ProcessorHandle {
                worker: WorkerId::new(),
                chunks: tx,
            }
        }
    }

    fn assignment(root: &std::path::Path, names: &[&str]) -> ExtractionAssignment {
        ExtractionAssignment {
            scan_id: ScanId::new(),
            medium: MediumIdentity::new("file:///music/cd1"),
            root: root.to_path_buf(),
            files: names
                .iter()
                .map(|name| FileDescriptor::new(root.join(name), 1000))
                .collect(),
        }
    }

    fn config(parallel: usize) -> EngineConfig {
        EngineConfig {
            parallel_count: parallel,
            ..EngineConfig::default()
        }
    }

    async fn next_spawn(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a spawn")
            .expect("factory dropped")
    }

    async fn next_event(rx: &mut mpsc::Receiver<ExtractionEvent>) -> ExtractionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("supervisor dropped")
    }

    async fn complete_file(worker_tx: &mpsc::Sender<ExtractorMessage>, uri: &str, title: &str) {
        worker_tx
            .send(ExtractorMessage::TagReady {
                uri: uri.to_string(),
                partial: TagPartial {
                    title: Some(title.to_string()),
                    ..TagPartial::default()
                },
            })
            .await
            .expect("supervisor alive");
        worker_tx
            .send(ExtractorMessage::FramesReady {
                uri: uri.to_string(),
                partial: FramePartial {
                    duration_ms: Some(180_000),
                    format: Some("MPEG 1 Layer III 192 kbit/s 44100 Hz".to_string()),
                },
            })
            .await
            .expect("supervisor alive");
    }

    #[tokio::test]
    async fn in_flight_files_respect_the_parallel_bound() {
        let (factory, mut spawns) = ScriptedFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let root = PathBuf::from("/music/cd1");
        tokio::spawn(run_medium_supervisor(
            assignment(&root, &["a.mp3", "b.mp3", "c.mp3", "d.mp3", "e.mp3"]),
            config(2),
            factory.clone(),
            events_tx,
            CancellationToken::new(),
        ));

        let first = next_spawn(&mut spawns).await;
        let second = next_spawn(&mut spawns).await;
        assert_eq!(first, "/a.mp3");
        assert_eq!(second, "/b.mp3");
        assert!(spawns.try_recv().is_err(), "third file must wait for a slot");

        let worker_tx = factory.worker_tx();
        complete_file(&worker_tx, "/a.mp3", "A").await;
        match next_event(&mut events_rx).await {
            ExtractionEvent::FileExtracted { record, .. } => {
                assert_eq!(record.title.as_deref(), Some("A"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(next_spawn(&mut spawns).await, "/c.mp3");
    }

    #[tokio::test]
    async fn read_failure_yields_an_empty_record_and_a_replacement() {
        let (factory, mut spawns) = ScriptedFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let root = PathBuf::from("/music/cd1");
        tokio::spawn(run_medium_supervisor(
            assignment(&root, &["a.mp3", "b.mp3"]),
            config(1),
            factory.clone(),
            events_tx,
            CancellationToken::new(),
        ));

        assert_eq!(next_spawn(&mut spawns).await, "/a.mp3");
        let worker_tx = factory.worker_tx();
        worker_tx
            .send(ExtractorMessage::ReadFailed {
                uri: "/a.mp3".to_string(),
                error: MetadataError::Io(std::io::Error::other("disk detached")),
            })
            .await
            .expect("supervisor alive");

        match next_event(&mut events_rx).await {
            ExtractionEvent::FileExtracted { record, .. } => {
                assert_eq!(record.uri, "/a.mp3");
                assert!(record.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The freed slot serves the next file, not a retry of the failed one.
        assert_eq!(next_spawn(&mut spawns).await, "/b.mp3");
        complete_file(&worker_tx, "/b.mp3", "B").await;
        match next_event(&mut events_rx).await {
            ExtractionEvent::FileExtracted { record, .. } => {
                assert_eq!(record.title.as_deref(), Some("B"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events_rx).await {
            ExtractionEvent::MediumExtracted {
                extracted,
                failed,
                aborted,
                ..
            } => {
                assert_eq!((extracted, failed, aborted), (1, 1, 0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crash_discards_merged_partials_and_ignores_stale_ones() {
        let (factory, mut spawns) = ScriptedFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let root = PathBuf::from("/music/cd1");
        tokio::spawn(run_medium_supervisor(
            assignment(&root, &["a.mp3"]),
            config(2),
            factory.clone(),
            events_tx,
            CancellationToken::new(),
        ));

        assert_eq!(next_spawn(&mut spawns).await, "/a.mp3");
        let worker_tx = factory.worker_tx();
        worker_tx
            .send(ExtractorMessage::TagReady {
                uri: "/a.mp3".to_string(),
                partial: TagPartial {
                    title: Some("Half Done".to_string()),
                    ..TagPartial::default()
                },
            })
            .await
            .expect("supervisor alive");
        worker_tx
            .send(ExtractorMessage::Crashed {
                uri: "/a.mp3".to_string(),
                role: crate::extract::processor::WorkerRole::FrameProcessor,
                message: "frame processor panicked".to_string(),
            })
            .await
            .expect("supervisor alive");
        // Stale partial from the torn-down trio arrives late.
        worker_tx
            .send(ExtractorMessage::FramesReady {
                uri: "/a.mp3".to_string(),
                partial: FramePartial::default(),
            })
            .await
            .expect("supervisor alive");

        match next_event(&mut events_rx).await {
            ExtractionEvent::FileExtracted { record, .. } => {
                assert!(record.is_empty(), "crash must not keep the merged tag");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events_rx).await {
            ExtractionEvent::MediumExtracted {
                extracted, failed, ..
            } => {
                assert_eq!((extracted, failed), (0, 1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_and_in_flight_files() {
        let (factory, mut spawns) = ScriptedFactory::new();
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let root = PathBuf::from("/music/cd1");
        tokio::spawn(run_medium_supervisor(
            assignment(&root, &["a.mp3", "b.mp3", "c.mp3"]),
            config(1),
            factory.clone(),
            events_tx,
            cancel.clone(),
        ));

        assert_eq!(next_spawn(&mut spawns).await, "/a.mp3");
        cancel.cancel();

        match next_event(&mut events_rx).await {
            ExtractionEvent::MediumExtracted {
                extracted,
                failed,
                aborted,
                ..
            } => {
                assert_eq!((extracted, failed, aborted), (0, 0, 3));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn real_factory_extracts_files_end_to_end() {
        fn syncsafe_bytes(value: u32) -> [u8; 4] {
            [
                ((value >> 21) & 0x7F) as u8,
                ((value >> 14) & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
                (value & 0x7F) as u8,
            ]
        }
        fn audio_bytes(title: &str) -> Vec<u8> {
            let mut frame = Vec::new();
            frame.extend_from_slice(b"TIT2");
            let mut payload = vec![0u8];
            payload.extend_from_slice(title.as_bytes());
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(&[0, 0]);
            frame.extend_from_slice(&payload);

            let mut data = Vec::new();
            data.extend_from_slice(b"ID3");
            data.extend_from_slice(&[3, 0, 0]);
            data.extend_from_slice(&syncsafe_bytes(frame.len() as u32));
            data.extend_from_slice(&frame);
            for _ in 0..4 {
                let mut mpeg = vec![0xFFu8, 0xFB, 0xB0, 0x00];
                mpeg.resize(626, 0);
                data.extend_from_slice(&mpeg);
            }
            data
        }

        let dir = tempfile::tempdir().expect("tempdir");
        for (name, title) in [("one.mp3", "First"), ("two.mp3", "Second")] {
            let mut file = std::fs::File::create(dir.path().join(name)).expect("create");
            file.write_all(&audio_bytes(title)).expect("write");
        }

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let files = vec![
            FileDescriptor::new(dir.path().join("one.mp3"), 0),
            FileDescriptor::new(dir.path().join("two.mp3"), 0),
        ];
        tokio::spawn(run_medium_supervisor(
            ExtractionAssignment {
                scan_id: ScanId::new(),
                medium: MediumIdentity::new("file:///music/cd1"),
                root: dir.path().to_path_buf(),
                files,
            },
            config(2),
            Arc::new(TokioExtractionFactory),
            events_tx,
            CancellationToken::new(),
        ));

        let mut titles = Vec::new();
        loop {
            match next_event(&mut events_rx).await {
                ExtractionEvent::FileExtracted { record, .. } => {
                    assert_eq!(record.medium.as_deref(), Some("file:///music/cd1"));
                    assert_eq!(record.duration_ms, Some(4 * 26_122 / 1000));
                    titles.push(record.title.expect("title extracted"));
                }
                ExtractionEvent::MediumExtracted {
                    extracted,
                    failed,
                    aborted,
                    ..
                } => {
                    assert_eq!((extracted, failed, aborted), (2, 0, 0));
                    break;
                }
            }
        }
        titles.sort();
        assert_eq!(titles, vec!["First".to_string(), "Second".to_string()]);
    }
}
