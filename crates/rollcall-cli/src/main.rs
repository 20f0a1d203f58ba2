use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Extractor, Gallery, IdentityId, ImageInput, OnnxProvider, Pose, ScopeId};
use rollcall_store::SqliteGallery;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, EngineHandle};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-matching attendance CLI")]
struct Cli {
    /// TOML config file (overridden by ROLLCALL_* variables and flags)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Gallery database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one pose sample for an identity
    Enroll {
        #[arg(long)]
        scope: i64,
        #[arg(long)]
        identity: i64,
        /// front, left, right, up or down
        #[arg(long, default_value = "front")]
        pose: Pose,
        image: PathBuf,
    },
    /// Recognize everyone visible in one or more images
    Recognize {
        #[arg(long)]
        scope: i64,
        /// Minimum rescaled cosine similarity (0..1)
        #[arg(long)]
        threshold: Option<f32>,
        /// Votes an identity needs across all probes
        #[arg(long)]
        min_votes: Option<usize>,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Compare the faces in two images
    Compare { a: PathBuf, b: PathBuf },
    /// List enrolled samples in a scope
    List {
        #[arg(long)]
        scope: i64,
    },
    /// Remove every sample of an identity from a scope
    Remove {
        #[arg(long)]
        scope: i64,
        #[arg(long)]
        identity: i64,
    },
}

fn read_image(path: &Path) -> Result<ImageInput> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ImageInput::Encoded(bytes))
}

fn start_engine(cfg: &Config) -> Result<EngineHandle> {
    let provider = OnnxProvider::load(&cfg.model_dir)
        .with_context(|| format!("loading models from {}", cfg.model_dir.display()))?;
    let extractor = Extractor::new(provider).with_selection(cfg.face_selection);
    Ok(spawn_engine(extractor)?)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }
    if let Some(dir) = cli.model_dir {
        cfg.model_dir = dir;
    }
    tracing::debug!(?cfg, "configuration resolved");

    match cli.command {
        Commands::Enroll {
            scope,
            identity,
            pose,
            image,
        } => {
            let store = SqliteGallery::open(&cfg.db_path)?;
            let engine = start_engine(&cfg)?;
            let Some(embedding) = engine.extract_single(read_image(&image)?).await? else {
                bail!("no face detected in {}", image.display());
            };
            let id = store.enroll(ScopeId(scope), IdentityId(identity), pose, &embedding)?;
            print_json(&serde_json::json!({
                "id": id,
                "scope": scope,
                "identity": identity,
                "pose": pose,
                "dimension": embedding.dimension(),
            }))?;
        }
        Commands::Recognize {
            scope,
            threshold,
            min_votes,
            images,
        } => {
            let mut params = cfg.match_params();
            if let Some(t) = threshold {
                params.threshold = t;
            }
            if let Some(n) = min_votes {
                params.min_votes = n;
            }

            let store = SqliteGallery::open(&cfg.db_path)?;
            let gallery = Gallery::load(&store, ScopeId(scope))?;
            if gallery.is_empty() {
                tracing::warn!(scope, "gallery is empty; nobody can be recognized");
            }

            let inputs = images
                .iter()
                .map(|p| read_image(p))
                .collect::<Result<Vec<_>>>()?;
            let engine = start_engine(&cfg)?;
            let recognition = engine.recognize(inputs, gallery, params).await?;
            print_json(&recognition)?;
        }
        Commands::Compare { a, b } => {
            let engine = start_engine(&cfg)?;
            let mut embeddings = Vec::with_capacity(2);
            for path in [&a, &b] {
                match engine.extract_single(read_image(path)?).await? {
                    Some(e) => embeddings.push(e),
                    None => bail!("no face detected in {}", path.display()),
                }
            }
            let (ea, eb) = (&embeddings[0], &embeddings[1]);
            print_json(&serde_json::json!({
                "similarity": ea.similarity(eb)?,
                "distance": ea.distance(eb)?,
            }))?;
        }
        Commands::List { scope } => {
            let store = SqliteGallery::open(&cfg.db_path)?;
            print_json(&store.list(ScopeId(scope))?)?;
        }
        Commands::Remove { scope, identity } => {
            let store = SqliteGallery::open(&cfg.db_path)?;
            let removed = store.remove_identity(ScopeId(scope), IdentityId(identity))?;
            if removed == 0 {
                bail!("identity {identity} has no samples in scope {scope}");
            }
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}
