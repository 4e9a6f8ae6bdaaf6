//! Configuration loading for the Melodex media indexer.
//!
//! Wraps [`EngineConfig`] with the embedder-facing knobs and resolves
//! where the configuration comes from: an explicit path or inline JSON
//! from the environment, a conventional file next to the working
//! directory, or built-in defaults. Validation runs at load time; the
//! findings are returned, not logged, so the caller decides how loudly
//! to surface them.
#![allow(missing_docs)]

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use melodex_core::{ConfigNote, EngineConfig};
use serde::{Deserialize, Serialize};

/// Environment variable naming a configuration file to load.
pub const CONFIG_PATH_VAR: &str = "MELODEX_CONFIG";
/// Environment variable carrying inline JSON configuration.
pub const CONFIG_INLINE_VAR: &str = "MELODEX_CONFIG_JSON";

/// Source that produced the store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for StoreConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConfigSource::Default => write!(f, "built-in defaults"),
            StoreConfigSource::EnvPath(path) => {
                write!(f, "${CONFIG_PATH_VAR} ({})", path.display())
            }
            StoreConfigSource::EnvInline => {
                write!(f, "${CONFIG_INLINE_VAR} inline json")
            }
            StoreConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Top-level settings: the engine tuning plus what the embedding binary
/// needs around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Engine tuning: chunk sizes, parallelism, batching, the metadata
    /// directory. See [`EngineConfig`] for the per-field effects.
    pub engine: EngineConfig,
    /// Default tracing filter installed when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

/// A resolved configuration: the values, where they came from, and the
/// validation findings the caller should log.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: StoreConfig,
    pub source: StoreConfigSource,
    pub notes: Vec<ConfigNote>,
}

impl StoreConfig {
    /// Load configuration overrides using environment variables.
    /// Evaluation order:
    /// 1) `$MELODEX_CONFIG` (TOML or JSON file),
    /// 2) `$MELODEX_CONFIG_JSON` (inline JSON),
    /// 3) a conventional file (`melodex.toml` and friends),
    /// 4) defaults if none is present.
    pub fn load_from_env() -> anyhow::Result<LoadedConfig> {
        if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return validated(config, StoreConfigSource::EnvPath(path));
        }

        if let Ok(raw) = env::var(CONFIG_INLINE_VAR)
            && !raw.trim().is_empty()
        {
            let config: StoreConfig = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse ${CONFIG_INLINE_VAR}"))?;
            return validated(config, StoreConfigSource::EnvInline);
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return validated(config, StoreConfigSource::File(path));
        }

        validated(Self::default(), StoreConfigSource::Default)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read melodex config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).with_context(|| {
                format!("invalid melodex config {}", path.display())
            }),
            Some("toml") | Some("tml") => {
                toml::from_str(&contents).map_err(|err| {
                    anyhow!("invalid melodex config {}: {}", path.display(), err)
                })
            }
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Parses contents of unknown format: TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse melodex config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "melodex.toml",
            "melodex.json",
            "config/melodex.toml",
            "config/melodex.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| path.to_path_buf())
    }
}

fn validated(
    mut config: StoreConfig,
    source: StoreConfigSource,
) -> anyhow::Result<LoadedConfig> {
    let notes = config
        .engine
        .validate()
        .with_context(|| format!("invalid melodex config from {source}"))?;
    Ok(LoadedConfig {
        config,
        source,
        notes,
    })
}
