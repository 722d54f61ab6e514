//! Batch migration engine
//!
//! Walks every record of every encryption-eligible entity type and forces the
//! stored value of each eligible field through the field codec again. Running
//! it with an encrypting codec converts a plaintext dataset to ciphertext;
//! running it with a pass-through codec converts ciphertext back. Work is
//! committed in batches and any crypto or persistence failure aborts the
//! whole run, leaving a mixed dataset that a later run picks up where this
//! one stopped.

use crate::codec::CodecMode;
use crate::error::Result;
use crate::schema::{eligible_entities, EligibleEntity};
use crate::{RecordStore, SchemaRegistry};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Number of processed records between batch commits.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Side-effect channels silenced for the duration of a migration run.
///
/// A dataset-wide rewrite must not cascade into search index updates or
/// audit history writes.
pub const SUPPRESSED_CHANNELS: &[&str] = &["search_index", "audit_history"];

/// Direction of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// Rewrite every eligible field to its encrypted representation
    Encrypt,
    /// Rewrite every eligible field back to plaintext
    Decrypt,
}

impl MigrationMode {
    /// Returns the codec mode for a run in this migration mode.
    ///
    /// Only a decrypt run that actually writes gets the pass-through codec. A
    /// decrypt dry-run keeps [`CodecMode::Encrypt`] since nothing is
    /// committed and reads must still decode.
    pub fn codec_mode(self, dry_run: bool) -> CodecMode {
        if self == MigrationMode::Decrypt && !dry_run {
            CodecMode::Decrypt
        } else {
            CodecMode::Encrypt
        }
    }

    /// Returns the verb used in console output and logs.
    pub fn verb(self) -> &'static str {
        match self {
            MigrationMode::Encrypt => "encrypt",
            MigrationMode::Decrypt => "decrypt",
        }
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Options for one migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Direction of the run
    pub mode: MigrationMode,

    /// When set, no commit is issued; classification and counting still run
    pub dry_run: bool,

    /// Processed records between batch commits
    pub batch_size: usize,
}

impl MigrationOptions {
    /// Creates options with the default batch size.
    pub fn new(mode: MigrationMode) -> Self {
        Self {
            mode,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Marks the run as a dry-run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Overrides the batch size. A batch size of zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Observer of migration progress.
///
/// The engine reports through this seam; display concerns such as progress
/// bars or output throttling belong to the implementation.
pub trait MigrationObserver: Send + Sync {
    /// Called once discovery found work, before any record is processed.
    fn run_started(&self, mode: MigrationMode, dry_run: bool, entities: &[EligibleEntity]);

    /// Called before the first record of an entity type.
    fn entity_started(&self, entity_type: &str, total: u64);

    /// Called after each processed record.
    fn progress(&self, entity_type: &str, processed: u64, total: u64);

    /// Called after the last record of an entity type.
    fn entity_finished(&self, report: &EntityReport);

    /// Called once the run is complete, including nothing-to-do runs.
    fn run_finished(&self, report: &MigrationReport);
}

/// An observer that discards all notifications.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl MigrationObserver for NoopObserver {
    fn run_started(&self, _mode: MigrationMode, _dry_run: bool, _entities: &[EligibleEntity]) {}

    fn entity_started(&self, _entity_type: &str, _total: u64) {}

    fn progress(&self, _entity_type: &str, _processed: u64, _total: u64) {}

    fn entity_finished(&self, _report: &EntityReport) {}

    fn run_finished(&self, _report: &MigrationReport) {}
}

/// Per-entity outcome of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    /// Entity type name
    pub entity_type: String,

    /// Record count reported by the store before streaming
    pub total: u64,

    /// Records actually processed
    pub processed: u64,

    /// Field rewrites queued, one per non-null eligible field
    pub fields_queued: u64,

    /// Batch commits issued while processing this entity type
    pub commits: u64,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Unique id of this run
    pub run_id: Uuid,

    /// Direction of the run
    pub mode: MigrationMode,

    /// Whether the run was a dry-run
    pub dry_run: bool,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished
    pub finished_at: DateTime<Utc>,

    /// Side-effect channels that were suspended for the duration of the run
    pub suspended_channels: Vec<String>,

    /// Per-entity outcomes in processing order; empty when discovery found
    /// nothing to do
    pub entities: Vec<EntityReport>,
}

impl MigrationReport {
    /// True when discovery found no eligible entity types.
    pub fn nothing_to_do(&self) -> bool {
        self.entities.is_empty()
    }

    /// Total records processed across entity types.
    pub fn records_processed(&self) -> u64 {
        self.entities.iter().map(|entity| entity.processed).sum()
    }

    /// Total field rewrites queued across entity types.
    pub fn fields_queued(&self) -> u64 {
        self.entities.iter().map(|entity| entity.fields_queued).sum()
    }

    /// Total batch commits issued across entity types.
    pub fn commits(&self) -> u64 {
        self.entities.iter().map(|entity| entity.commits).sum()
    }
}

/// Orchestrates one dataset-wide encryption or decryption pass.
///
/// The engine is single-threaded and processes entity types one after the
/// other. The store's codec must have been built with
/// [`MigrationMode::codec_mode`] for the run's mode and dry-run flag.
pub struct MigrationEngine {
    /// The persistence layer being migrated
    store: Arc<dyn RecordStore>,

    /// Source of entity metadata for discovery
    registry: Arc<dyn SchemaRegistry>,

    /// Run options
    options: MigrationOptions,

    /// Progress sink
    observer: Arc<dyn MigrationObserver>,
}

impl MigrationEngine {
    /// Creates an engine reporting to a no-op observer.
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn SchemaRegistry>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            store,
            registry,
            options,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn MigrationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs the migration to completion.
    ///
    /// Any key, crypto, or persistence failure aborts the run; suspended
    /// side-effect channels are restored on every exit path. Interrupting and
    /// re-running is safe because already-converted values are recognized and
    /// left untouched.
    pub fn run(&self) -> Result<MigrationReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        log::info!(
            "{} run {} starting (dry_run: {})",
            self.options.mode,
            run_id,
            self.options.dry_run
        );

        let entities = eligible_entities(self.registry.as_ref())?;

        if entities.is_empty() {
            log::info!("{} run {}: no eligible entity types", self.options.mode, run_id);

            let report = self.report(run_id, started_at, Vec::new(), Vec::new());
            self.observer.run_finished(&report);

            return Ok(report);
        }

        self.observer
            .run_started(self.options.mode, self.options.dry_run, &entities);

        let suspension = self.store.suspend_side_effects(SUPPRESSED_CHANNELS)?;
        let suspended_channels = suspension.suspended().to_vec();

        let mut reports = Vec::with_capacity(entities.len());

        for entity in &entities {
            reports.push(self.process_entity(entity)?);
        }

        drop(suspension);

        let report = self.report(run_id, started_at, suspended_channels, reports);

        log::info!(
            "{} run {} finished: {} records across {} entity types",
            self.options.mode,
            run_id,
            report.records_processed(),
            report.entities.len()
        );
        self.observer.run_finished(&report);

        Ok(report)
    }

    fn process_entity(&self, entity: &EligibleEntity) -> Result<EntityReport> {
        let total = self.store.count(&entity.entity_type)?;
        self.observer.entity_started(&entity.entity_type, total);

        log::info!("processing {}: {} records", entity.entity_type, total);

        let batch_size = self.options.batch_size.max(1) as u64;
        let mut cursor = self.store.stream(&entity.entity_type)?;
        let mut processed = 0_u64;
        let mut fields_queued = 0_u64;
        let mut commits = 0_u64;

        while let Some(record) = cursor.next_record()? {
            for field in &entity.fields {
                // Null fields have nothing to rewrite
                if record.value(field).is_some() {
                    self.store
                        .queue_rewrite(&entity.entity_type, record.id(), field)?;
                    fields_queued += 1;
                }
            }

            processed += 1;

            if processed % batch_size == 0 {
                commits += self.flush_batch()?;
            }

            self.observer.progress(&entity.entity_type, processed, total);
        }

        // Remainder smaller than a full batch
        commits += self.flush_batch()?;

        counter!("fel.migrate.records", processed);
        counter!("fel.migrate.commits", commits);

        let report = EntityReport {
            entity_type: entity.entity_type.clone(),
            total,
            processed,
            fields_queued,
            commits,
        };
        self.observer.entity_finished(&report);

        Ok(report)
    }

    /// Commits pending rewrites, or discards them on a dry-run. Either way
    /// the batch's tracking state is released.
    fn flush_batch(&self) -> Result<u64> {
        if self.options.dry_run {
            self.store.discard_pending();

            return Ok(0);
        }

        if self.store.pending_rewrites() == 0 {
            return Ok(0);
        }

        self.store.commit()?;

        Ok(1)
    }

    fn report(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        suspended_channels: Vec<String>,
        entities: Vec<EntityReport>,
    ) -> MigrationReport {
        MigrationReport {
            run_id,
            mode: self.options.mode,
            dry_run: self.options.dry_run,
            started_at,
            finished_at: Utc::now(),
            suspended_channels,
            entities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_mode_selection() {
        assert_eq!(
            MigrationMode::Encrypt.codec_mode(false),
            CodecMode::Encrypt
        );
        assert_eq!(MigrationMode::Encrypt.codec_mode(true), CodecMode::Encrypt);
        assert_eq!(
            MigrationMode::Decrypt.codec_mode(false),
            CodecMode::Decrypt
        );

        // A decrypt dry-run must not get the pass-through codec
        assert_eq!(MigrationMode::Decrypt.codec_mode(true), CodecMode::Encrypt);
    }

    #[test]
    fn test_batch_size_of_zero_is_treated_as_one() {
        let options = MigrationOptions::new(MigrationMode::Encrypt).with_batch_size(0);

        assert_eq!(options.batch_size, 1);
    }

    #[test]
    fn test_mode_verbs() {
        assert_eq!(MigrationMode::Encrypt.to_string(), "encrypt");
        assert_eq!(MigrationMode::Decrypt.to_string(), "decrypt");
    }
}
