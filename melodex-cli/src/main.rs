//! `melodex` — index a directory of audio media.
//!
//! Walks the given root, treats every subdirectory holding audio files
//! as one medium, runs the metadata engine over the result and prints a
//! per-medium summary. Persisted metadata lands in the configured
//! metadata directory and is reused on the next run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use melodex_config::{LoadedConfig, StoreConfig, StoreConfigSource};
use melodex_core::{
    EngineOutput, FileDescriptor, MediumIdentity, MediumListing,
    MetadataEngine, ScanResult,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// File extensions treated as audio content.
const AUDIO_EXTENSIONS: &[&str] = &["mp3"];

/// Conventional per-medium description file name.
const DESCRIPTION_FILE: &str = "medium.settings";

#[derive(Debug, Parser)]
#[command(name = "melodex", version, about = "Index a directory of audio media")]
struct Args {
    /// Directory to index. Each subdirectory with audio files is one
    /// medium.
    root: PathBuf,

    /// Configuration file (TOML or JSON). Defaults to the environment
    /// and conventional locations.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the persisted-metadata directory.
    #[arg(long)]
    metadata_dir: Option<PathBuf>,

    /// Override the reader parallelism.
    #[arg(long)]
    parallel_count: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => {
            let mut config = StoreConfig::load_from_file(path)?;
            let notes = config
                .engine
                .validate()
                .with_context(|| format!("invalid config {}", path.display()))?;
            LoadedConfig {
                config,
                source: StoreConfigSource::File(path.clone()),
                notes,
            }
        }
        None => StoreConfig::load_from_env()?,
    };
    let LoadedConfig {
        mut config,
        source,
        notes,
    } = loaded;

    if let Some(dir) = &args.metadata_dir {
        config.engine.metadata_dir = dir.clone();
    }
    if let Some(count) = args.parallel_count {
        config.engine.parallel_count = count;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(%source, "configuration loaded");
    for note in &notes {
        match &note.hint {
            Some(hint) => warn!(message = %note.message, %hint, "config note"),
            None => warn!(message = %note.message, "config note"),
        }
    }

    let media = collect_media(&args.root)
        .with_context(|| format!("failed to scan {}", args.root.display()))?;
    if media.is_empty() {
        bail!("no audio media found under {}", args.root.display());
    }
    info!(
        root = %args.root.display(),
        media = media.len(),
        files = media.iter().map(|m| m.files.len()).sum::<usize>(),
        "scan complete"
    );

    let handle = MetadataEngine::builder(config.engine)
        .build()
        .context("engine configuration rejected")?
        .start();
    let mut outputs = handle
        .records()
        .context("engine output stream already taken")?;

    let expected = media.len();
    handle
        .submit_scan(ScanResult::new(media))
        .await
        .context("engine rejected the scan")?;

    let mut summaries = 0usize;
    let mut total_records = 0usize;
    let mut total_unresolved = 0usize;
    while summaries < expected {
        let Some(output) = outputs.recv().await else {
            bail!("engine stopped before every medium completed");
        };
        match output {
            EngineOutput::Records(batch) => {
                total_records += batch.records.len();
            }
            EngineOutput::Unresolved(report) => {
                if !report.is_fully_resolved() {
                    info!(
                        medium = %report.listing.identity,
                        unresolved = report.unresolved_count(),
                        of = report.total_files(),
                        "files without persisted metadata"
                    );
                }
            }
            EngineOutput::Summary(summary) => {
                summaries += 1;
                total_unresolved += summary.unresolved;
                println!(
                    "{}: {} files, {} resolved, {} unresolved, {} written",
                    summary.medium_uri,
                    summary.total_files,
                    summary.resolved,
                    summary.unresolved,
                    summary.records_written,
                );
            }
        }
    }

    handle.shutdown().await.context("engine shutdown failed")?;
    println!(
        "{expected} media processed, {total_records} records, {total_unresolved} files unresolved"
    );
    Ok(())
}

/// One medium per subdirectory with audio files; audio files directly
/// under the root form a medium of their own. Deterministic order so
/// reader assignment is reproducible.
fn collect_media(root: &Path) -> anyhow::Result<Vec<MediumListing>> {
    let mut media = Vec::new();
    let mut root_files = Vec::new();

    for entry in fs::read_dir(root)
        .with_context(|| format!("cannot list {}", root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            let files = collect_audio_files(&path)?;
            if !files.is_empty() {
                media.push(medium_listing(&path, files));
            }
        } else if is_audio(&path) {
            root_files.push(FileDescriptor::new(
                path.clone(),
                entry.metadata()?.len(),
            ));
        }
    }

    if !root_files.is_empty() {
        root_files.sort();
        media.push(medium_listing(root, root_files));
    }
    media.sort_by(|a, b| a.identity.uri.cmp(&b.identity.uri));
    Ok(media)
}

fn medium_listing(dir: &Path, files: Vec<FileDescriptor>) -> MediumListing {
    let description = dir.join(DESCRIPTION_FILE);
    let identity = if description.is_file() {
        MediumIdentity::with_description(dir.display().to_string(), description)
    } else {
        MediumIdentity::new(dir.display().to_string())
    };
    MediumListing::new(identity, dir, files)
}

/// Recursive, sorted audio listing beneath one medium directory.
fn collect_audio_files(dir: &Path) -> anyhow::Result<Vec<FileDescriptor>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)
            .with_context(|| format!("cannot list {}", current.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if is_audio(&path) {
                files.push(FileDescriptor::new(path, entry.metadata()?.len()));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            AUDIO_EXTENSIONS
                .iter()
                .any(|audio| ext.eq_ignore_ascii_case(audio))
        })
}
