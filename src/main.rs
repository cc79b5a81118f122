use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notes_smart_index::config::{default_config_path, EngineConfig};
use notes_smart_index::embeddings::{FastEmbedder, DIMENSIONS};
use notes_smart_index::protocol::Envelope;
use notes_smart_index::session::Session;
use notes_smart_index::source::{detect_joplin_db_path, JoplinSource};
use notes_smart_index::store::VectorStore;
use notes_smart_index::types::{SearchResult, Stage};
use notes_smart_index::{init_tracing, Engine};

#[derive(Parser)]
#[command(name = "notes-smart-index")]
#[command(about = "Semantic search index for Joplin notes")]
#[command(version)]
struct Cli {
    /// Config file (defaults to config.toml in the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak the JSON message protocol on stdin/stdout and watch the notes database
    Serve,
    /// Run one indexing cycle and print its stats
    Index,
    /// Search the index
    Search {
        query: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Notes closest to an already indexed note
    Similar {
        note_id: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show index health
    Status,
    /// Write a config file with every setting at its default
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.config.as_deref();
    match cli.command {
        Commands::InitConfig { force } => init_config(config, force),
        Commands::Serve => serve(load_config(config)?).await,
        Commands::Index => index(load_config(config)?).await,
        Commands::Search { query, limit } => search(load_config(config)?, &query, limit).await,
        Commands::Similar { note_id, limit } => {
            similar(load_config(config)?, &note_id, limit).await
        }
        Commands::Status => status(load_config(config)?),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = EngineConfig::load(path).context("failed to load config")?;
    config.validate()?;
    Ok(config)
}

fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path().context("no data directory on this platform; pass --config")?,
    };
    write_default_config(&path, force)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    EngineConfig::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Open the store, the Joplin database and the embedding model.
fn build_engine(config: EngineConfig, show_download: bool) -> Result<Engine> {
    let db_path = match config.source.joplin_db.clone() {
        Some(path) => path,
        None => detect_joplin_db_path()
            .context("Joplin database not found; set [source] joplin_db in the config")?,
    };
    info!(db = %db_path.display(), "using Joplin database");

    let embedder = FastEmbedder::new(&config.model_cache_dir, show_download)
        .context("failed to load embedding model")?;
    let engine = Engine::new(config, Arc::new(JoplinSource::new(db_path)), Arc::new(embedder))
        .context("failed to open vector store")?;
    Ok(engine)
}

async fn serve(config: EngineConfig) -> Result<()> {
    // Download progress would corrupt the protocol stream.
    let engine = build_engine(config, false)?;
    let cancel = CancellationToken::new();
    let _source_changes = engine.wire_source_changes();
    let watcher = engine.spawn_watcher(cancel.child_token());

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = rx.recv().await {
            let line = match envelope.to_json() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode outbound message: {e}");
                    continue;
                }
            };
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let session = Session::new(engine.clone(), tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        session.handle_text(&line);
    }

    info!("stdin closed, shutting down");
    cancel.cancel();
    engine.coordinator().cancel();
    session.close();
    watcher.await?;
    writer.await??;
    Ok(())
}

async fn index(config: EngineConfig) -> Result<()> {
    let engine = build_engine(config, true)?;
    let snapshot = engine.start_indexing()?.wait().await;
    let stats = snapshot.stats;

    if snapshot.stage == Stage::Failed {
        bail!(
            "indexing failed: {}",
            snapshot.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!(
        "new: {}  modified: {}  unchanged: {}  deleted: {}  in trash: {}  errors: {}",
        stats.new, stats.modified, stats.unchanged, stats.deleted, stats.in_trash, stats.errors
    );
    Ok(())
}

async fn search(config: EngineConfig, query: &str, limit: Option<usize>) -> Result<()> {
    let engine = build_engine(config, true)?;
    let results = engine.search().search(query, limit).await?;
    print_results(&results);
    Ok(())
}

async fn similar(config: EngineConfig, note_id: &str, limit: Option<usize>) -> Result<()> {
    let engine = build_engine(config, true)?;
    let results = engine.search().similar(note_id, limit).await?;
    print_results(&results);
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
    }
    for result in results {
        println!("{:.3}  {}  ({})", result.similarity_score, result.title, result.id);
    }
}

/// Reads the store only; the model is not loaded.
fn status(config: EngineConfig) -> Result<()> {
    let store = VectorStore::open(&config.store_path, DIMENSIONS)
        .context("failed to open vector store")?;
    println!("indexed notes: {}", store.count()?);
    let completed = store
        .last_completed_at()?
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis);
    match completed {
        Some(at) => println!("last completed: {}", at.to_rfc3339()),
        None => println!("last completed: never"),
    }
    Ok(())
}
