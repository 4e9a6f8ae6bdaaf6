//! File-level extraction workers.
//!
//! Each in-flight file runs three tasks: a file reader streaming chunks,
//! a tag processor and a frame processor consuming them. The reader fans
//! every chunk out to both processors; each processor folds its scanner
//! over the stream and reports one partial when the last chunk lands.
//! Workers never talk to each other, only to the medium supervisor.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use melodex_model::WorkerId;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::MetadataError;
use crate::extract::frames::{FramePartial, FrameScanner};
use crate::extract::id3::{Id3Scanner, TagPartial};

/// Chunk mailbox depth per processor. Shallow so a slow processor
/// backpressures its file reader instead of buffering the whole file.
pub const CHUNK_CHANNEL_CAPACITY: usize = 8;

/// One chunk of an audio file. The payload is shared, not copied, between
/// the tag and frame processors.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub data: Arc<Vec<u8>>,
    /// Set on the final, empty chunk after the read hits end of file.
    pub last: bool,
}

/// Which worker of a file's trio an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    FileReader,
    TagProcessor,
    FrameProcessor,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerRole::FileReader => "file reader",
            WorkerRole::TagProcessor => "tag processor",
            WorkerRole::FrameProcessor => "frame processor",
        };
        f.write_str(label)
    }
}

/// Everything a file reader needs to stream one file.
#[derive(Debug, Clone)]
pub struct FileReadRequest {
    pub worker: WorkerId,
    pub uri: String,
    pub path: PathBuf,
    pub read_chunk_size: usize,
}

/// Messages the per-file workers send their medium supervisor.
#[derive(Debug)]
pub enum ExtractorMessage {
    TagReady { uri: String, partial: TagPartial },
    FramesReady { uri: String, partial: FramePartial },
    ReadDone { uri: String, bytes: u64 },
    ReadFailed { uri: String, error: MetadataError },
    /// A worker task panicked. Reported by the spawn monitor, never by
    /// the worker itself.
    Crashed {
        uri: String,
        role: WorkerRole,
        message: String,
    },
}

/// Handle to a running processor: its identity and chunk mailbox.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    pub worker: WorkerId,
    pub chunks: mpsc::Sender<FileChunk>,
}

/// The worker trio serving one in-flight file.
#[derive(Debug)]
pub struct FileWorkerSet {
    pub reader: WorkerId,
    pub tag: ProcessorHandle,
    pub frames: ProcessorHandle,
}

/// Worker sets keyed by file URI. Entries are created lazily when a file
/// is assigned and removed when its contribution is consumed or the file
/// is torn down; dropping the set closes both chunk mailboxes.
#[derive(Debug, Default)]
pub struct ProcessorPool {
    workers: HashMap<String, FileWorkerSet>,
}

impl ProcessorPool {
    /// Returns the worker set for `uri`, invoking `create` on first use.
    pub fn get_or_create(
        &mut self,
        uri: &str,
        create: impl FnOnce() -> FileWorkerSet,
    ) -> &FileWorkerSet {
        self.workers.entry(uri.to_string()).or_insert_with(create)
    }

    /// Removes and returns the worker set, if the file is still in flight.
    pub fn remove(&mut self, uri: &str) -> Option<FileWorkerSet> {
        self.workers.remove(uri)
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.workers.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Drops every worker set, closing all chunk mailboxes.
    pub fn clear(&mut self) {
        self.workers.clear();
    }
}

/// Constructs and launches extraction workers. The engine injects the
/// tokio-backed factory; supervisor tests inject scripted ones to drive
/// message sequences without spawning tasks or touching disk.
pub trait ExtractionWorkerFactory: Send + Sync + fmt::Debug {
    /// Spawn a reader that streams `request.path` to every sink in order.
    fn spawn_file_reader(
        &self,
        request: FileReadRequest,
        sinks: Vec<mpsc::Sender<FileChunk>>,
        events: mpsc::Sender<ExtractorMessage>,
        cancel: CancellationToken,
    ) -> WorkerId;

    /// Spawn a tag processor; the returned handle carries its chunk
    /// mailbox.
    fn spawn_tag_processor(
        &self,
        uri: String,
        tag_size_limit: usize,
        events: mpsc::Sender<ExtractorMessage>,
    ) -> ProcessorHandle;

    /// Spawn a frame processor; the returned handle carries its chunk
    /// mailbox.
    fn spawn_frame_processor(
        &self,
        uri: String,
        events: mpsc::Sender<ExtractorMessage>,
    ) -> ProcessorHandle;
}

/// Production factory: one tokio task per worker plus a monitor task that
/// converts a panic into a `Crashed` message so the supervisor always
/// observes a terminal state.
#[derive(Debug, Default, Clone)]
pub struct TokioExtractionFactory;

impl TokioExtractionFactory {
    fn monitor(
        task: tokio::task::JoinHandle<()>,
        uri: String,
        role: WorkerRole,
        events: mpsc::Sender<ExtractorMessage>,
    ) {
        tokio::spawn(async move {
            if let Err(join_err) = task.await
                && join_err.is_panic()
            {
                let _ = events
                    .send(ExtractorMessage::Crashed {
                        uri,
                        role,
                        message: format!("{role} panicked: {join_err}"),
                    })
                    .await;
            }
        });
    }
}

impl ExtractionWorkerFactory for TokioExtractionFactory {
    fn spawn_file_reader(
        &self,
        request: FileReadRequest,
        sinks: Vec<mpsc::Sender<FileChunk>>,
        events: mpsc::Sender<ExtractorMessage>,
        cancel: CancellationToken,
    ) -> WorkerId {
        let worker = request.worker;
        let uri = request.uri.clone();
        let monitor_events = events.clone();
        let task = tokio::spawn(run_file_reader(request, sinks, events, cancel));
        Self::monitor(task, uri, WorkerRole::FileReader, monitor_events);
        worker
    }

    fn spawn_tag_processor(
        &self,
        uri: String,
        tag_size_limit: usize,
        events: mpsc::Sender<ExtractorMessage>,
    ) -> ProcessorHandle {
        let worker = WorkerId::new();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let monitor_events = events.clone();
        let task = tokio::spawn(run_tag_processor(uri.clone(), tag_size_limit, rx, events));
        Self::monitor(task, uri, WorkerRole::TagProcessor, monitor_events);
        ProcessorHandle { worker, chunks: tx }
    }

    fn spawn_frame_processor(
        &self,
        uri: String,
        events: mpsc::Sender<ExtractorMessage>,
    ) -> ProcessorHandle {
        let worker = WorkerId::new();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let monitor_events = events.clone();
        let task = tokio::spawn(run_frame_processor(uri.clone(), rx, events));
        Self::monitor(task, uri, WorkerRole::FrameProcessor, monitor_events);
        ProcessorHandle { worker, chunks: tx }
    }
}

/// Reader body: streams the file in `read_chunk_size` chunks to every
/// sink, then a final empty chunk with `last` set, then `ReadDone`. A
/// sink whose processor has gone away is skipped; the read stops entirely
/// only when no sink is left.
async fn run_file_reader(
    request: FileReadRequest,
    sinks: Vec<mpsc::Sender<FileChunk>>,
    events: mpsc::Sender<ExtractorMessage>,
    cancel: CancellationToken,
) {
    let uri = request.uri;
    debug!(
        target: "extract::worker",
        worker = %request.worker,
        uri = %uri,
        file = %request.path.display(),
        "file reader starting"
    );

    let mut file = match File::open(&request.path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = events
                .send(ExtractorMessage::ReadFailed {
                    uri,
                    error: MetadataError::Io(e),
                })
                .await;
            return;
        }
    };

    let mut bytes = 0u64;
    let mut buf = vec![0u8; request.read_chunk_size.max(1)];
    loop {
        if cancel.is_cancelled() {
            let _ = events
                .send(ExtractorMessage::ReadFailed {
                    uri,
                    error: MetadataError::Cancelled("file read cancelled".into()),
                })
                .await;
            return;
        }

        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                let _ = events
                    .send(ExtractorMessage::ReadFailed {
                        uri,
                        error: MetadataError::Io(e),
                    })
                    .await;
                return;
            }
        };
        let last = read == 0;
        bytes += read as u64;

        let chunk = FileChunk {
            data: Arc::new(buf[..read].to_vec()),
            last,
        };
        let mut delivered = false;
        for sink in &sinks {
            if sink.send(chunk.clone()).await.is_ok() {
                delivered = true;
            }
        }
        if !delivered {
            // Both processors are gone: the file was torn down.
            trace!(target: "extract::worker", uri = %uri, "no chunk sink left, stopping read");
            return;
        }

        if last {
            let _ = events.send(ExtractorMessage::ReadDone { uri, bytes }).await;
            return;
        }
    }
}

/// Tag processor body: folds the ID3 scanner over the chunk stream. A
/// mailbox closed before the last chunk means the reader died early; the
/// partial covering what did arrive is reported either way and the
/// supervisor decides whether it still matters.
async fn run_tag_processor(
    uri: String,
    tag_size_limit: usize,
    mut chunks: mpsc::Receiver<FileChunk>,
    events: mpsc::Sender<ExtractorMessage>,
) {
    let mut scanner = Id3Scanner::new(tag_size_limit);
    while let Some(chunk) = chunks.recv().await {
        scanner.push(&chunk.data);
        if chunk.last {
            break;
        }
    }
    let partial = scanner.finish();
    let _ = events
        .send(ExtractorMessage::TagReady { uri, partial })
        .await;
}

/// Frame processor body, same shape as the tag processor.
async fn run_frame_processor(
    uri: String,
    mut chunks: mpsc::Receiver<FileChunk>,
    events: mpsc::Sender<ExtractorMessage>,
) {
    let mut scanner = FrameScanner::new();
    while let Some(chunk) = chunks.recv().await {
        scanner.push(&chunk.data);
        if chunk.last {
            break;
        }
    }
    let partial = scanner.finish();
    let _ = events
        .send(ExtractorMessage::FramesReady { uri, partial })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write as _;
    use std::time::Duration;

    fn syncsafe_bytes(value: u32) -> [u8; 4] {
        [
            ((value >> 21) & 0x7F) as u8,
            ((value >> 14) & 0x7F) as u8,
            ((value >> 7) & 0x7F) as u8,
            (value & 0x7F) as u8,
        ]
    }

    /// ID3v2.3 tag with one TIT2 frame, followed by three CBR MPEG frames.
    fn audio_file_bytes(title: &str) -> Vec<u8> {
        let mut tag_frame = Vec::new();
        tag_frame.extend_from_slice(b"TIT2");
        let mut payload = vec![0u8];
        payload.extend_from_slice(title.as_bytes());
        tag_frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        tag_frame.extend_from_slice(&[0, 0]);
        tag_frame.extend_from_slice(&payload);

        let mut data = Vec::new();
        data.extend_from_slice(b"ID3");
        data.extend_from_slice(&[3, 0, 0]);
        data.extend_from_slice(&syncsafe_bytes(tag_frame.len() as u32));
        data.extend_from_slice(&tag_frame);
        for _ in 0..3 {
            // MPEG1 Layer III, 192 kbps, 44100 Hz: 626-byte frames
            let mut frame = vec![0xFF, 0xFB, 0xB0, 0x00];
            frame.resize(626, 0);
            data.extend_from_slice(&frame);
        }
        data
    }

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create temp file");
        file.write_all(data).expect("write temp file");
        path
    }

    async fn collect_messages(
        rx: &mut mpsc::Receiver<ExtractorMessage>,
        count: usize,
    ) -> Vec<ExtractorMessage> {
        let mut messages = Vec::new();
        while messages.len() < count {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for worker message")
                .expect("worker channel closed early");
            messages.push(msg);
        }
        messages
    }

    #[tokio::test]
    async fn file_trio_delivers_both_partials_and_read_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = audio_file_bytes("Freddie Freeloader");
        let path = write_temp(&dir, "a.mp3", &data);

        let factory = TokioExtractionFactory;
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let tag = factory.spawn_tag_processor("/a.mp3".into(), 64 * 1024, events_tx.clone());
        let frames = factory.spawn_frame_processor("/a.mp3".into(), events_tx.clone());
        factory.spawn_file_reader(
            FileReadRequest {
                worker: WorkerId::new(),
                uri: "/a.mp3".into(),
                path,
                read_chunk_size: 37,
            },
            vec![tag.chunks.clone(), frames.chunks.clone()],
            events_tx,
            CancellationToken::new(),
        );

        let messages = collect_messages(&mut events_rx, 3).await;
        let mut saw_tag = false;
        let mut saw_frames = false;
        let mut saw_done = false;
        for msg in messages {
            match msg {
                ExtractorMessage::TagReady { uri, partial } => {
                    assert_eq!(uri, "/a.mp3");
                    assert_eq!(partial.title.as_deref(), Some("Freddie Freeloader"));
                    saw_tag = true;
                }
                ExtractorMessage::FramesReady { uri, partial } => {
                    assert_eq!(uri, "/a.mp3");
                    assert_eq!(partial.duration_ms, Some(3 * 26_122 / 1000));
                    saw_frames = true;
                }
                ExtractorMessage::ReadDone { bytes, .. } => {
                    assert_eq!(bytes, data.len() as u64);
                    saw_done = true;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(saw_tag && saw_frames && saw_done);
    }

    #[tokio::test]
    async fn missing_file_reports_an_io_failure() {
        let factory = TokioExtractionFactory;
        let (events_tx, mut events_rx) = mpsc::channel(4);
        factory.spawn_file_reader(
            FileReadRequest {
                worker: WorkerId::new(),
                uri: "/gone.mp3".into(),
                path: PathBuf::from("/nonexistent/gone.mp3"),
                read_chunk_size: 64,
            },
            Vec::new(),
            events_tx,
            CancellationToken::new(),
        );
        match collect_messages(&mut events_rx, 1).await.remove(0) {
            ExtractorMessage::ReadFailed { uri, error } => {
                assert_eq!(uri, "/gone.mp3");
                assert!(matches!(error, MetadataError::Io(_)));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_read_before_any_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_temp(&dir, "b.mp3", &[0u8; 512]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let factory = TokioExtractionFactory;
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (sink_tx, mut sink_rx) = mpsc::channel(4);
        factory.spawn_file_reader(
            FileReadRequest {
                worker: WorkerId::new(),
                uri: "/b.mp3".into(),
                path,
                read_chunk_size: 64,
            },
            vec![sink_tx],
            events_tx,
            cancel,
        );
        match collect_messages(&mut events_rx, 1).await.remove(0) {
            ExtractorMessage::ReadFailed { error, .. } => {
                assert!(matches!(error, MetadataError::Cancelled(_)));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn processor_flushes_its_partial_when_the_reader_dies_early() {
        let factory = TokioExtractionFactory;
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let handle = factory.spawn_tag_processor("/c.mp3".into(), 64 * 1024, events_tx);

        // Push part of a file, then drop the sender without a last chunk.
        let mut data = vec![0x00u8; 200];
        data.extend_from_slice(b"ID3"); // not at offset 0, stays garbage
        handle
            .chunks
            .send(FileChunk {
                data: Arc::new(data),
                last: false,
            })
            .await
            .expect("processor alive");
        drop(handle.chunks);

        match collect_messages(&mut events_rx, 1).await.remove(0) {
            ExtractorMessage::TagReady { uri, partial } => {
                assert_eq!(uri, "/c.mp3");
                assert!(partial.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn pool_creates_lazily_and_removes_once() {
        let mut pool = ProcessorPool::default();
        let (tx, _rx) = mpsc::channel(1);
        let mut created = 0;
        for _ in 0..2 {
            pool.get_or_create("/a.mp3", || {
                created += 1;
                FileWorkerSet {
                    reader: WorkerId::new(),
                    tag: ProcessorHandle {
                        worker: WorkerId::new(),
                        chunks: tx.clone(),
                    },
                    frames: ProcessorHandle {
                        worker: WorkerId::new(),
                        chunks: tx.clone(),
                    },
                }
            });
        }
        assert_eq!(created, 1);
        assert_eq!(pool.len(), 1);
        assert!(pool.remove("/a.mp3").is_some());
        assert!(pool.remove("/a.mp3").is_none());
        assert!(pool.is_empty());
    }
}
