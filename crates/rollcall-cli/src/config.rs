use anyhow::{Context, Result};
use rollcall_core::matcher::{DEFAULT_MIN_VOTES, DEFAULT_THRESHOLD};
use rollcall_core::{FaceSelection, MatchParams};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables. CLI flags are applied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Minimum rescaled cosine similarity for a probe to vote.
    pub similarity_threshold: f32,
    /// Votes required before an identity is recognized.
    pub min_votes: usize,
    /// Face kept when an enrollment image holds several.
    pub face_selection: FaceSelection,
}

/// On-disk form; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub similarity_threshold: Option<f32>,
    pub min_votes: Option<usize>,
    pub face_selection: Option<FaceSelection>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = rollcall_core::default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("gallery.db"),
            similarity_threshold: DEFAULT_THRESHOLD,
            min_votes: DEFAULT_MIN_VOTES,
            face_selection: FaceSelection::default(),
        }
    }
}

impl Config {
    /// Load from the optional config file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = file.map(FileConfig::read).transpose()?;
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    /// Layer `file` and then `env` over the defaults.
    pub fn from_sources(file: Option<FileConfig>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(f) = file {
            if let Some(v) = f.model_dir {
                cfg.model_dir = v;
            }
            if let Some(v) = f.db_path {
                cfg.db_path = v;
            }
            if let Some(v) = f.similarity_threshold {
                cfg.similarity_threshold = v;
            }
            if let Some(v) = f.min_votes {
                cfg.min_votes = v;
            }
            if let Some(v) = f.face_selection {
                cfg.face_selection = v;
            }
        }

        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        cfg.similarity_threshold = env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD", cfg.similarity_threshold);
        cfg.min_votes = env_parse(&env, "ROLLCALL_MIN_VOTES", cfg.min_votes);
        cfg.face_selection = env_parse(&env, "ROLLCALL_FACE_SELECTION", cfg.face_selection);

        cfg
    }

    pub fn match_params(&self) -> MatchParams {
        MatchParams {
            threshold: self.similarity_threshold,
            min_votes: self.min_votes,
        }
    }
}

/// Parse `key` from `env`, keeping `default` when unset or unparsable.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match env(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            default
        }),
        None => default,
    }
}
