//! chunkstore - command line front end for a local chunk store
//!
//! Subcommands:
//! - `chunkstore put <file>` - Store a file, print its reference
//! - `chunkstore get <reference>` - Write stored content to a file or stdout
//! - `chunkstore stat` - Print store usage as JSON
//! - `chunkstore gc --capacity <bytes>` - Shrink the database to a new capacity

use anyhow::{Context as _, Result};
use chunkstore::{Context, LocalStore, Reference, StoreParams, StreamStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

/// Bytes fetched per read when streaming content out.
const READ_WINDOW: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "chunkstore")]
#[command(about = "Content-addressed chunk storage")]
#[command(version)]
struct Cli {
    /// TOML file with a [chunkstore] section
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and environment)
    #[arg(short, long, global = true, env = "CHUNKSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file and print its reference
    Put {
        /// File to store
        file: PathBuf,

        /// Encrypt chunks; the printed reference carries the key
        #[arg(short, long)]
        encrypt: bool,

        /// Seconds to wait for all chunks to be stored
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },

    /// Write stored content to a file or stdout
    Get {
        /// Reference printed by `put` (64 or 128 hex chars)
        reference: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print chunk count, bytes used and capacities as JSON
    Stat,

    /// Apply a new database capacity, evicting least recently used chunks
    Gc {
        /// New capacity in bytes
        #[arg(long)]
        capacity: u64,
    },
}

fn load_params(cli: &Cli) -> Result<StoreParams> {
    let mut params = match &cli.config {
        Some(path) => StoreParams::from_file(path)?,
        None => StoreParams::from_env()?,
    };
    if let Some(dir) = &cli.data_dir {
        params.data_dir = dir.clone();
    }
    Ok(params)
}

async fn put(streams: &StreamStore, file: PathBuf, encrypt: bool, timeout: u64) -> Result<()> {
    let handle = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
    let size = handle.metadata().await?.len();

    let ctx = Context::with_timeout(Duration::from_secs(timeout));
    let (reference, completion) = streams.store(&ctx, handle, size, encrypt).await?;
    let chunks = completion.chunk_count();
    completion
        .wait(&ctx)
        .await
        .context("chunks were not all stored")?;

    info!(file = %file.display(), size, chunks, encrypted = encrypt, "stored");
    println!("{reference}");
    Ok(())
}

async fn get(streams: &StreamStore, reference: &str, output: Option<PathBuf>) -> Result<()> {
    let reference: Reference = reference.parse().context("invalid reference")?;
    let (reader, _encrypted) = streams.retrieve(&reference);

    let mut sink: Box<dyn AsyncWrite + Unpin + Send> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut buf = vec![0u8; READ_WINDOW];
    let mut offset = 0u64;
    loop {
        let outcome = reader.read_at(&mut buf, offset).await?;
        sink.write_all(&buf[..outcome.read]).await?;
        offset += outcome.read as u64;
        if outcome.eof {
            break;
        }
    }
    sink.flush().await?;

    info!(size = offset, "retrieved");
    Ok(())
}

fn stat(store: &LocalStore, params: &StoreParams) -> Result<()> {
    let db = store.db();
    let report = serde_json::json!({
        "data_dir": params.data_dir,
        "chunks": db.len()?,
        "bytes": db.size_bytes()?,
        "db_capacity": db.capacity()?,
        "cache_capacity": store.mem().capacity(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn gc(store: &LocalStore, capacity: u64) -> Result<()> {
    let evicted = store.db().set_capacity(capacity)?;
    println!("evicted {evicted} chunks, {} bytes remain", store.db().size_bytes()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let params = load_params(&cli)?;
    let store = Arc::new(
        LocalStore::open(&params)
            .with_context(|| format!("failed to open store at {}", params.data_dir.display()))?,
    );
    let streams = StreamStore::with_params(store.clone(), &params);

    match cli.command {
        Commands::Put {
            file,
            encrypt,
            timeout,
        } => put(&streams, file, encrypt, timeout).await?,
        Commands::Get { reference, output } => get(&streams, &reference, output).await?,
        Commands::Stat => stat(&store, &params)?,
        Commands::Gc { capacity } => gc(&store, capacity)?,
    }

    Ok(())
}
