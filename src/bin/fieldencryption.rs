//! Command-line migration tool for JSON datasets
//!
//! Loads a dataset file, runs an encrypt or decrypt migration over every
//! eligible field, and writes the converted dataset back in place. The
//! dataset declares its own schema:
//!
//! ```json
//! {
//!   "entities": {
//!     "customer": {
//!       "fields": { "email": "encrypted_text", "name": "text" },
//!       "records": [
//!         { "id": 1, "values": { "email": "jane@example.com", "name": "Jane" } }
//!       ]
//!     }
//!   }
//! }
//! ```

use clap::{Parser, Subcommand};
use fieldencryption::migrate::{EntityReport, SUPPRESSED_CHANNELS};
use fieldencryption::{
    EligibleEntity, EncryptedFieldCodec, Encryptor, EntityMetadata, FileKeyProvider,
    InMemoryRecordStore, InMemorySchemaRegistry, MigrationEngine, MigrationMode,
    MigrationObserver, MigrationOptions, MigrationReport, RecordId, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Records between progress lines
const PROGRESS_EVERY: u64 = 50;

#[derive(Parser)]
#[command(author, version, about = "Encrypts and decrypts dataset fields in place")]
struct Cli {
    /// Path to the encryption key file (created on first use)
    #[arg(long)]
    key_file: PathBuf,

    /// Path to the JSON dataset migrated in place
    #[arg(long)]
    data_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite every eligible field to its encrypted representation
    Encrypt {
        /// Classify and count without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Rewrite every eligible field back to plaintext
    Decrypt {
        /// Classify and count without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

/// On-disk dataset: entity types with field declarations and records
#[derive(Debug, Default, Serialize, Deserialize)]
struct Dataset {
    entities: BTreeMap<String, EntityData>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EntityData {
    /// Abstract base types own no records and are skipped by discovery
    #[serde(
        default,
        rename = "abstract",
        skip_serializing_if = "std::ops::Not::not"
    )]
    is_abstract: bool,

    /// Field name to declared storage type
    fields: BTreeMap<String, String>,

    #[serde(default)]
    records: Vec<RecordData>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordData {
    id: RecordId,
    values: BTreeMap<String, Option<String>>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let (mode, dry_run) = match &cli.command {
        Commands::Encrypt { dry_run } => (MigrationMode::Encrypt, *dry_run),
        Commands::Decrypt { dry_run } => (MigrationMode::Decrypt, *dry_run),
    };

    if dry_run {
        println!("Dry-run. No changes will be saved.");
    }

    let dataset = read_dataset(&cli.data_file)?;
    let registry = Arc::new(build_registry(&dataset));

    let options = MigrationOptions::new(mode).with_dry_run(dry_run);
    let provider = Arc::new(FileKeyProvider::new(&cli.key_file));
    log::debug!("using key file {}", provider.path().display());

    let encryptor = Arc::new(Encryptor::new(provider));
    let codec = Arc::new(EncryptedFieldCodec::with_mode(
        encryptor,
        options.mode.codec_mode(options.dry_run),
    ));

    let store = Arc::new(InMemoryRecordStore::new(codec, registry.as_ref())?);

    for name in SUPPRESSED_CHANNELS {
        store.register_channel(*name);
    }

    seed_store(&store, &dataset)?;

    let engine = MigrationEngine::new(store.clone(), registry, options)
        .with_observer(Arc::new(ConsoleObserver));
    let report = engine.run()?;

    if report.nothing_to_do() {
        return Ok(());
    }

    if !dry_run {
        let migrated = export_dataset(&store, &dataset);
        write_dataset(&cli.data_file, &migrated)?;
    }

    Ok(())
}

/// Prints migration progress to stdout
struct ConsoleObserver;

impl MigrationObserver for ConsoleObserver {
    fn run_started(&self, mode: MigrationMode, _dry_run: bool, entities: &[EligibleEntity]) {
        println!("{} entity types to {}.", entities.len(), mode.verb());
    }

    fn entity_started(&self, entity_type: &str, total: u64) {
        println!("Processing {} ({} records)", entity_type, total);
    }

    fn progress(&self, _entity_type: &str, processed: u64, total: u64) {
        if processed % PROGRESS_EVERY == 0 || processed == total {
            println!("  {}/{}", processed, total);
        }
    }

    fn entity_finished(&self, report: &EntityReport) {
        println!(
            "{}: {} records processed, {} fields rewritten, {} commits",
            report.entity_type, report.processed, report.fields_queued, report.commits
        );
    }

    fn run_finished(&self, report: &MigrationReport) {
        if report.nothing_to_do() {
            println!("Nothing to {}.", report.mode.verb());
        } else {
            println!(
                "Run {} complete: {} records across {} entity types.",
                report.run_id,
                report.records_processed(),
                report.entities.len()
            );
        }
    }
}

fn read_dataset(path: &Path) -> Result<Dataset> {
    let text = fs::read_to_string(path)?;

    Ok(serde_json::from_str(&text)?)
}

fn write_dataset(path: &Path, dataset: &Dataset) -> Result<()> {
    let mut text = serde_json::to_string_pretty(dataset)?;
    text.push('\n');
    fs::write(path, text)?;

    Ok(())
}

fn build_registry(dataset: &Dataset) -> InMemorySchemaRegistry {
    let mut registry = InMemorySchemaRegistry::new();

    for (entity_type, data) in &dataset.entities {
        let mut entity = EntityMetadata::new(entity_type.clone());

        if data.is_abstract {
            entity = entity.abstract_base();
        }

        for (field, storage_type) in &data.fields {
            entity = entity.with_field(field.clone(), storage_type.clone());
        }

        registry = registry.with_entity(entity);
    }

    registry
}

fn seed_store(store: &InMemoryRecordStore, dataset: &Dataset) -> Result<()> {
    for (entity_type, data) in &dataset.entities {
        for record in &data.records {
            let values: HashMap<String, Option<String>> = record
                .values
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();

            store.insert_raw(entity_type, record.id, values)?;
        }
    }

    Ok(())
}

fn export_dataset(store: &InMemoryRecordStore, source: &Dataset) -> Dataset {
    let mut migrated = Dataset::default();

    for (entity_type, data) in &source.entities {
        let records = store
            .export_raw(entity_type)
            .into_iter()
            .map(|(id, values)| RecordData {
                id,
                values: values.into_iter().collect(),
            })
            .collect();

        migrated.entities.insert(
            entity_type.clone(),
            EntityData {
                is_abstract: data.is_abstract,
                fields: data.fields.clone(),
                records,
            },
        );
    }

    migrated
}
