use clap::Parser;
use conversion_engine::application::config::AppConfig;
use conversion_engine::application::executor::ConversionExecutor;
use conversion_engine::domain::ledger::ConversionLedgerEntry;
use conversion_engine::domain::ports::LedgerStoreBox;
use conversion_engine::infrastructure::in_memory::{
    InMemoryLedgerStore, InMemoryPaymentVerifier, InMemoryTreasury,
};
use conversion_engine::interfaces::csv::entry_writer::EntryWriter;
use conversion_engine::interfaces::csv::request_reader::{RequestReader, RequestRow};
use conversion_engine::logging::init_logging;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Conversion requests CSV file. An optional `payment_status` column feeds
    /// payment verification; rows without it are not verified as paid.
    input: PathBuf,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent ledger database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Starting treasury balance in base units of the default denomination
    #[arg(long, default_value_t = 0)]
    treasury_balance: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> Result<LedgerStoreBox> {
    use conversion_engine::infrastructure::rocksdb::RocksDBLedgerStore;

    match db_path {
        Some(path) => Ok(Box::new(RocksDBLedgerStore::open(path).into_diagnostic()?)),
        None => Ok(Box::new(InMemoryLedgerStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> Result<LedgerStoreBox> {
    if db_path.is_some() {
        warn!(
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    Ok(Box::new(InMemoryLedgerStore::new()))
}

fn record(entries: &mut Vec<ConversionLedgerEntry>, entry: ConversionLedgerEntry) {
    match entries.iter_mut().find(|e| e.id == entry.id) {
        Some(slot) => *slot = entry,
        None => entries.push(entry),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::from_yaml_file(path).into_diagnostic()?,
        None => AppConfig::default(),
    };
    if cli.log_json {
        config.logging.json = true;
    }
    init_logging(&config.logging);

    let store = open_store(cli.db_path.as_deref())?;
    let treasury = InMemoryTreasury::new(config.executor.treasury_address.clone())
        .with_address_prefix(config.executor.address_prefix.clone());
    treasury
        .fund(&config.executor.default_denom, cli.treasury_balance)
        .await;
    let payments = InMemoryPaymentVerifier::new();
    let executor = ConversionExecutor::new(store, Box::new(treasury), config.executor)
        .with_payment_verifier(Arc::new(payments.clone()));

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = RequestReader::new(file);
    let mut entries = Vec::new();
    for row in reader.requests() {
        match row {
            Ok(RequestRow {
                request: req,
                payment_status,
            }) => {
                if let Some(status) = payment_status {
                    payments
                        .set_status(req.payment_intent_id.clone(), status)
                        .await;
                }
                let key = req.idempotency_key.clone();
                match executor.execute_conversion(req).await {
                    Ok(result) => record(&mut entries, result.ledger_entry),
                    Err(e) => warn!(idempotency_key = %key, error = %e, "Conversion request refused"),
                }
            }
            Err(e) => warn!(error = %e, "Error reading conversion request"),
        }
    }
    info!(entries = entries.len(), "Batch finished");

    let stdout = io::stdout();
    let mut writer = EntryWriter::new(stdout.lock());
    writer.write_entries(&entries).into_diagnostic()?;

    Ok(())
}
