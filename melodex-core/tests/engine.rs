//! End-to-end engine tests: real filesystem, real workers, scripted
//! readers only where concurrency or crashes need to be forced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use melodex_core::store::codec::encode_batch;
use melodex_core::store::compute_medium_checksum;
use melodex_core::store::reader::{
    ReadRequest, ReaderEvent, ReaderOutcome, ReaderWorkerFactory,
};
use melodex_core::{
    EngineConfig, EngineOutput, FileDescriptor, MediumIdentity, MediumListing,
    MediumSummary, MetadataEngine, MetadataRecord, RecordOrigin, ScanResult,
    UnresolvedFilesReport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn listing(root: &Path, files: &[(&str, u64)]) -> MediumListing {
    let files = files
        .iter()
        .map(|(name, size)| FileDescriptor::new(root.join(name), *size))
        .collect();
    MediumListing::new(
        MediumIdentity::new(root.display().to_string()),
        root,
        files,
    )
}

fn record(uri: &str, title: &str, size: u64) -> MetadataRecord {
    MetadataRecord {
        title: Some(title.to_string()),
        ..MetadataRecord::unresolved(uri, size)
    }
}

/// Persist `records` for `listing` the way the writer would, named by the
/// listing's checksum.
fn seed_metadata_file(
    metadata_dir: &Path,
    listing: &MediumListing,
    records: &[MetadataRecord],
) -> PathBuf {
    let checksum = compute_medium_checksum(listing);
    let target = metadata_dir.join(format!("{checksum}.mdt"));
    std::fs::write(&target, encode_batch(records).expect("encode")).expect("seed");
    target
}

/// Everything the output stream produced up to the `expected`th summary.
#[derive(Default)]
struct Drained {
    persisted: Vec<MetadataRecord>,
    extracted: Vec<MetadataRecord>,
    reports: Vec<UnresolvedFilesReport>,
    summaries: Vec<MediumSummary>,
}

async fn drain(
    outputs: &mut mpsc::Receiver<EngineOutput>,
    expected: usize,
) -> Drained {
    let mut drained = Drained::default();
    while drained.summaries.len() < expected {
        let output = tokio::time::timeout(Duration::from_secs(10), outputs.recv())
            .await
            .expect("timed out waiting for engine output")
            .expect("engine stopped early");
        match output {
            EngineOutput::Records(batch) => match batch.origin {
                RecordOrigin::PersistedFile => {
                    drained.persisted.extend(batch.records)
                }
                RecordOrigin::Extraction => {
                    drained.extracted.extend(batch.records)
                }
            },
            EngineOutput::Unresolved(report) => drained.reports.push(report),
            EngineOutput::Summary(summary) => drained.summaries.push(summary),
        }
    }
    drained
}

#[tokio::test]
async fn known_medium_streams_persisted_records_without_extraction() {
    let media_root = tempfile::tempdir().expect("tempdir");
    let meta_dir = tempfile::tempdir().expect("tempdir");

    let files: Vec<(String, u64)> = (1..=8)
        .map(|i| (format!("{i:02}.mp3"), 1000 + i))
        .collect();
    let file_refs: Vec<(&str, u64)> =
        files.iter().map(|(name, size)| (name.as_str(), *size)).collect();
    let album = listing(&media_root.path().join("album"), &file_refs);

    let records: Vec<MetadataRecord> = files
        .iter()
        .map(|(name, size)| record(&format!("/{name}"), name, *size))
        .collect();
    seed_metadata_file(meta_dir.path(), &album, &records);

    let handle = MetadataEngine::builder(EngineConfig::new(meta_dir.path()))
        .build()
        .expect("valid config")
        .start();
    let mut outputs = handle.records().expect("fresh engine");
    handle
        .submit_scan(ScanResult::new(vec![album]))
        .await
        .expect("engine running");

    let drained = drain(&mut outputs, 1).await;
    assert_eq!(drained.persisted.len(), 8);
    assert!(drained.extracted.is_empty(), "nothing should need extraction");
    assert_eq!(drained.reports.len(), 1);
    assert!(drained.reports[0].is_fully_resolved());

    let summary = &drained.summaries[0];
    assert_eq!(summary.total_files, 8);
    assert_eq!(summary.resolved, 8);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(summary.resolved + summary.unresolved, summary.total_files);
    assert_eq!(summary.records_written, 0, "fully resolved media skip the writer");

    handle.shutdown().await.expect("clean shutdown");
}

fn syncsafe_bytes(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}

/// A minimal mp3: one ID3v2.3 TIT2 frame, then a few MPEG frames.
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

#[tokio::test]
async fn unknown_medium_reports_extracts_and_resolves_on_rescan() {
    let media_root = tempfile::tempdir().expect("tempdir");
    let meta_dir = tempfile::tempdir().expect("tempdir");

    let album_dir = media_root.path().join("album");
    std::fs::create_dir_all(&album_dir).expect("mkdir");
    let bytes = audio_bytes("\"Live\" at the Vanguard");
    std::fs::write(album_dir.join("01.mp3"), &bytes).expect("write");
    let album = listing(&album_dir, &[("01.mp3", bytes.len() as u64)]);

    let handle = MetadataEngine::builder(EngineConfig::new(meta_dir.path()))
        .build()
        .expect("valid config")
        .start();
    let mut outputs = handle.records().expect("fresh engine");
    handle
        .submit_scan(ScanResult::new(vec![album.clone()]))
        .await
        .expect("engine running");

    let drained = drain(&mut outputs, 1).await;
    // The report comes first and shows nothing resolved.
    assert_eq!(drained.reports.len(), 1);
    assert_eq!(drained.reports[0].resolved_count(), 0);
    assert_eq!(drained.reports[0].unresolved_count(), 1);
    // Extraction produced the record, embedded quotes intact.
    assert!(drained.persisted.is_empty());
    assert_eq!(drained.extracted.len(), 1);
    assert_eq!(
        drained.extracted[0].title.as_deref(),
        Some("\"Live\" at the Vanguard")
    );
    let summary = &drained.summaries[0];
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(summary.records_written, 1);
    handle.shutdown().await.expect("clean shutdown");

    // The extracted record landed under the medium's checksum.
    let checksum = compute_medium_checksum(&album);
    let target = meta_dir.path().join(format!("{checksum}.mdt"));
    assert!(target.exists(), "writer must persist the extracted record");

    // A rescan of the unchanged medium resolves from disk.
    let handle = MetadataEngine::builder(EngineConfig::new(meta_dir.path()))
        .build()
        .expect("valid config")
        .start();
    let mut outputs = handle.records().expect("fresh engine");
    handle
        .submit_scan(ScanResult::new(vec![album]))
        .await
        .expect("engine running");

    let drained = drain(&mut outputs, 1).await;
    assert_eq!(drained.persisted.len(), 1);
    assert_eq!(
        drained.persisted[0].title.as_deref(),
        Some("\"Live\" at the Vanguard")
    );
    assert!(drained.extracted.is_empty());
    assert!(drained.reports[0].is_fully_resolved());
    handle.shutdown().await.expect("clean shutdown");
}

/// Reader factory that resolves every medium with one scripted record and
/// tracks how many readers overlap.
#[derive(Debug)]
struct ScriptedReaderFactory {
    active: AtomicUsize,
    max_active: AtomicUsize,
    order: Mutex<Vec<String>>,
    /// Media whose reader reports a crash instead of records.
    crash: Vec<String>,
    hold: Duration,
}

impl ScriptedReaderFactory {
    fn new(hold: Duration, crash: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            crash,
            hold,
        })
    }

    fn max_seen(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn spawn_order(&self) -> Vec<String> {
        self.order.lock().expect("order lock").clone()
    }
}

/// Local wrapper so the foreign trait can be implemented for the shared
/// factory without tripping the orphan rule.
#[derive(Debug)]
struct ScriptedFactoryHandle(Arc<ScriptedReaderFactory>);

impl ReaderWorkerFactory for ScriptedFactoryHandle {
    fn spawn_reader(
        &self,
        request: ReadRequest,
        events: mpsc::Sender<ReaderEvent>,
        _cancel: CancellationToken,
    ) -> melodex_core::WorkerId {
        let worker = request.worker;
        let medium_uri = request.medium.uri.clone();
        self.0.order.lock().expect("order lock").push(medium_uri.clone());
        let running = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(running, Ordering::SeqCst);
        let this = Arc::clone(&self.0);
        tokio::spawn(async move {
            tokio::time::sleep(this.hold).await;
            let outcome = if this.crash.contains(&medium_uri) {
                ReaderOutcome::Crashed {
                    message: "scripted crash".into(),
                }
            } else {
                let _ = events
                    .send(ReaderEvent::Records {
                        worker,
                        records: vec![record("/01.mp3", "scripted", 100)],
                    })
                    .await;
                ReaderOutcome::Completed {
                    published: 1,
                    skipped: 0,
                }
            };
            this.active.fetch_sub(1, Ordering::SeqCst);
            let _ = events.send(ReaderEvent::Finished { worker, outcome }).await;
        });
        worker
    }
}

#[tokio::test]
async fn reader_parallelism_is_bounded_and_fifo() {
    let media_root = tempfile::tempdir().expect("tempdir");
    let meta_dir = tempfile::tempdir().expect("tempdir");

    // Five known media, one file each, sizes kept distinct so the
    // checksums differ.
    let mut media = Vec::new();
    for i in 0..5u64 {
        let album = listing(
            &media_root.path().join(format!("album{i}")),
            &[("01.mp3", 100 + i)],
        );
        seed_metadata_file(meta_dir.path(), &album, &[]);
        media.push(album);
    }
    let submitted: Vec<String> =
        media.iter().map(|m| m.identity.uri.clone()).collect();

    let factory =
        ScriptedReaderFactory::new(Duration::from_millis(25), Vec::new());
    let config = EngineConfig {
        parallel_count: 2,
        ..EngineConfig::new(meta_dir.path())
    };
    let handle = MetadataEngine::builder(config)
        .with_reader_factory(Arc::new(ScriptedFactoryHandle(Arc::clone(&factory))))
        .build()
        .expect("valid config")
        .start();
    let mut outputs = handle.records().expect("fresh engine");
    handle
        .submit_scan(ScanResult::new(media))
        .await
        .expect("engine running");

    let drained = drain(&mut outputs, 5).await;
    assert_eq!(drained.summaries.len(), 5);
    for summary in &drained.summaries {
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved, 0);
    }
    assert!(
        factory.max_seen() <= 2,
        "at most two readers may overlap, saw {}",
        factory.max_seen()
    );
    assert_eq!(factory.spawn_order(), submitted, "assignment must be FIFO");

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn crashed_reader_frees_its_slot_for_the_next_medium() {
    let media_root = tempfile::tempdir().expect("tempdir");
    let meta_dir = tempfile::tempdir().expect("tempdir");

    let first = listing(&media_root.path().join("first"), &[("01.mp3", 10)]);
    let second = listing(&media_root.path().join("second"), &[("01.mp3", 20)]);
    seed_metadata_file(meta_dir.path(), &first, &[]);
    seed_metadata_file(meta_dir.path(), &second, &[]);

    let factory = ScriptedReaderFactory::new(
        Duration::from_millis(5),
        vec![first.identity.uri.clone()],
    );
    let config = EngineConfig {
        parallel_count: 1,
        ..EngineConfig::new(meta_dir.path())
    };
    let handle = MetadataEngine::builder(config)
        .with_reader_factory(Arc::new(ScriptedFactoryHandle(Arc::clone(&factory))))
        .build()
        .expect("valid config")
        .start();
    let mut outputs = handle.records().expect("fresh engine");
    handle
        .submit_scan(ScanResult::new(vec![first.clone(), second.clone()]))
        .await
        .expect("engine running");

    let drained = drain(&mut outputs, 2).await;

    // The crashed medium's slot went to the next medium, not a retry.
    assert_eq!(
        factory.spawn_order(),
        vec![first.identity.uri.clone(), second.identity.uri.clone()]
    );

    let crashed = drained
        .summaries
        .iter()
        .find(|s| s.medium_uri == first.identity.uri)
        .expect("crashed medium still summarizes");
    // The unreadable file went to extraction, which could not open it
    // either; the file stays unresolved.
    assert_eq!(crashed.resolved, 0);
    assert_eq!(crashed.unresolved, 1);

    let completed = drained
        .summaries
        .iter()
        .find(|s| s.medium_uri == second.identity.uri)
        .expect("second medium summarizes");
    assert_eq!(completed.resolved, 1);
    assert_eq!(completed.unresolved, 0);

    handle.shutdown().await.expect("clean shutdown");
}
