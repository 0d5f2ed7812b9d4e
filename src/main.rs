use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch::{
    config, Embedding, FaceMetadata, FaceRecord, FaceSearch, FileStore, RowKey, UserId,
};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facematch")]
#[command(
    version,
    about = "Find the closest matching faces across archival and registered-user photos"
)]
struct Cli {
    /// Config file (defaults to the installed location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or replace a face row from a JSON embedding file
    Enroll {
        /// Row key of the face
        #[arg(short, long)]
        row_key: String,
        /// JSON file holding an array of 128 floats
        #[arg(short, long)]
        embedding: PathBuf,
        /// Owning account; makes this a live user row instead of an archival one
        #[arg(short, long)]
        user: Option<u64>,
        /// Display name shown on match cards
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(long)]
        era: Option<String>,
        #[arg(long)]
        region: Option<String>,
    },
    /// Mark an archival face as claimed by an account
    Claim {
        #[arg(short, long)]
        row_key: String,
        #[arg(short, long)]
        user: u64,
    },
    /// Remove a face row
    Purge {
        #[arg(short, long)]
        row_key: String,
    },
    /// Rebuild the index from the stored embeddings
    Rebuild,
    /// Search for the closest faces
    Search {
        /// JSON file holding the query embedding
        #[arg(short, long, conflicts_with = "row_key", required_unless_present = "row_key")]
        embedding: Option<PathBuf>,
        /// Use the embedding of a stored row as the query
        #[arg(short, long)]
        row_key: Option<String>,
        /// Leave the query row itself out of the results
        #[arg(long, requires = "row_key")]
        exclude_self: bool,
        /// Nearest neighbors to fetch
        #[arg(short)]
        k: Option<usize>,
        /// Maximum number of cards to return
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Show index state
    Status,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll {
            row_key,
            embedding,
            user,
            name,
            era,
            region,
        } => {
            let metadata = FaceMetadata {
                display_name: name,
                era,
                region,
            };
            enroll(&cfg, &row_key, &embedding, user.map(UserId), metadata)
        }
        Commands::Claim { row_key, user } => claim(&cfg, &row_key, UserId(user)),
        Commands::Purge { row_key } => purge(&cfg, &row_key),
        Commands::Rebuild => rebuild(&cfg),
        Commands::Search {
            embedding,
            row_key,
            exclude_self,
            k,
            top_k,
        } => search(&cfg, embedding, row_key, exclude_self, k, top_k),
        Commands::Status => status(&cfg),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn open_store(cfg: &config::Config) -> Result<FileStore> {
    let path = cfg.store_path();
    FileStore::open(&path)
        .with_context(|| format!("Failed to open face store {}", path.display()))
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading embedding {}", path.display()))?;
    let values: Vec<f32> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing embedding {}", path.display()))?;
    Embedding::from_vec(values)
        .with_context(|| format!("invalid embedding in {}", path.display()))
}

fn enroll(
    cfg: &config::Config,
    row_key: &str,
    embedding: &Path,
    user: Option<UserId>,
    metadata: FaceMetadata,
) -> Result<()> {
    let embedding = read_embedding(embedding)?;
    let store = open_store(cfg)?;

    let record = match user {
        Some(user) => FaceRecord::live_user(row_key, user, embedding.to_bytes(), metadata),
        None => FaceRecord::archival(row_key, embedding.to_bytes(), metadata),
    };
    store
        .save_record(record)
        .context("Failed to save face record")?;

    info!("✓ Face {} enrolled", row_key);
    info!("Run 'rebuild' to make it searchable.");
    Ok(())
}

fn claim(cfg: &config::Config, row_key: &str, user: UserId) -> Result<()> {
    let store = open_store(cfg)?;
    store
        .claim(&RowKey::from(row_key), user)
        .context("Failed to claim face")?;
    info!("✓ Face {} claimed by user {}", row_key, user);
    Ok(())
}

fn purge(cfg: &config::Config, row_key: &str) -> Result<()> {
    let store = open_store(cfg)?;
    if store.purge(&RowKey::from(row_key))? {
        info!("✓ Face {} removed", row_key);
    } else {
        warn!("No face row {}", row_key);
    }
    Ok(())
}

fn rebuild(cfg: &config::Config) -> Result<()> {
    let store = Arc::new(open_store(cfg)?);
    info!("Rebuilding index from {} face row(s)", store.len());

    let search = FaceSearch::new(cfg, store);
    let report = search.try_rebuild().context("Index rebuild failed")?;

    for skipped in &report.skipped {
        warn!("{}", skipped);
    }
    info!(
        "✓ Indexed {} face(s), skipped {}",
        report.vector_count,
        report.skipped.len()
    );
    Ok(())
}

fn search(
    cfg: &config::Config,
    embedding: Option<PathBuf>,
    row_key: Option<String>,
    exclude_self: bool,
    k: Option<usize>,
    top_k: Option<usize>,
) -> Result<()> {
    let store = Arc::new(open_store(cfg)?);

    let query = match (&embedding, &row_key) {
        (Some(path), _) => read_embedding(path)?,
        (None, Some(key)) => {
            let record = store
                .get(&RowKey::from(key.as_str()))
                .with_context(|| format!("No face row {}", key))?;
            Embedding::from_bytes(&record.embedding)
                .with_context(|| format!("Stored embedding of {} is malformed", key))?
        }
        (None, None) => anyhow::bail!("either --embedding or --row-key is required"),
    };

    let search = FaceSearch::new(cfg, store);
    let mut request = search.request(k);
    if let Some(top_k) = top_k {
        request = request.top_k(top_k);
    }
    if exclude_self {
        if let Some(key) = row_key {
            request = request.excluding(key);
        }
    }

    let outcome = search.search_with(&query.vector.to_vec(), &request);
    if let Some(reason) = outcome.reason {
        info!("{}", reason);
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn status(cfg: &config::Config) -> Result<()> {
    let store = Arc::new(open_store(cfg)?);
    let search = FaceSearch::new(cfg, store);
    // Status of a fresh process is only meaningful once the persisted index is loaded
    if !search.manager().ensure_loaded() {
        warn!("Index is not available");
    }
    println!("{}", serde_json::to_string_pretty(&search.status())?);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH).as_os_str();
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
