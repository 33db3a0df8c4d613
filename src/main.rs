use chrono::Utc;
use clap::Parser;
use dispatch::config::DispatchConfig;
use dispatch::domain::ports::DatabaseRef;
use dispatch::infrastructure::in_memory::InMemoryDatabase;
use dispatch::interfaces::csv::command_reader::CommandReader;
use dispatch::interfaces::csv::wallet_writer::WalletWriter;
use dispatch::interfaces::replay::Replay;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON configuration file (optional). Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn open_database(db_path: Option<PathBuf>) -> Result<DatabaseRef> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = dispatch::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Arc::new(InMemoryDatabase::new()))
        }
        None => Ok(Arc::new(InMemoryDatabase::new())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dispatch=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DispatchConfig::from_file(path).into_diagnostic()?,
        None => DispatchConfig::default(),
    };
    let db = open_database(cli.db_path)?;
    let mut replay = Replay::new(db, config, Utc::now());

    // Replay commands
    let file = File::open(cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    for (line, command) in reader.commands().enumerate() {
        match command {
            Ok(command) => {
                if let Err(e) = replay.apply(&command).await {
                    eprintln!("Error processing command {}: {}", line + 1, e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command {}: {}", line + 1, e);
            }
        }
    }

    // Output final wallets
    let wallets = replay.wallets().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = WalletWriter::new(stdout.lock());
    writer.write_wallets(wallets).into_diagnostic()?;

    Ok(())
}
