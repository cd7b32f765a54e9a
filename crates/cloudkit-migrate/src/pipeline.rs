//! Migration pipeline orchestration.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::assets::AssetTransferer;
use crate::config::{MigrationConfig, RecordTypeMapping};
use crate::convert::FieldConverter;
use crate::destination::{Destination, Document, FieldValue};
use crate::error::Result;
use crate::source::{create_source, RecordSource, SourceRecord};

/// Outcome of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationResult {
    /// Converted and written.
    Migrated,
    /// Written, but these asset fields kept their source URL.
    Degraded(Vec<String>),
    /// Not written.
    Failed(String),
    /// Converted only (dry run).
    Skipped,
}

/// Counters for one record type.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TypeStats {
    /// Records fetched from the source.
    pub fetched: u64,
    /// Records written without degradation.
    pub migrated: u64,
    /// Records written with at least one passthrough asset.
    pub degraded: u64,
    /// Records not written.
    pub failed: u64,
    /// Records converted but not written (dry run).
    pub skipped: u64,
    /// Fetch error that aborted the type, if any.
    pub fetch_error: Option<String>,
}

impl TypeStats {
    fn record(&mut self, result: &MigrationResult) {
        match result {
            MigrationResult::Migrated => self.migrated += 1,
            MigrationResult::Degraded(_) => self.degraded += 1,
            MigrationResult::Failed(_) => self.failed += 1,
            MigrationResult::Skipped => self.skipped += 1,
        }
    }
}

/// Migration statistics.
#[derive(Debug, Default, Clone)]
pub struct MigrationStats {
    /// Per record type, keyed by type name.
    pub per_type: BTreeMap<String, TypeStats>,
    /// Total records fetched.
    pub fetched: u64,
    /// Records written without degradation.
    pub migrated: u64,
    /// Records written with passthrough assets.
    pub degraded: u64,
    /// Records that failed.
    pub failed: u64,
    /// Records skipped by dry run.
    pub skipped: u64,
    /// Record types whose fetch failed.
    pub failed_types: Vec<String>,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl MigrationStats {
    /// Calculate throughput (records per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            (self.migrated + self.degraded) as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    /// Returns `true` if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.failed_types.is_empty()
    }

    fn add(&mut self, record_type: &str, stats: TypeStats) {
        self.fetched += stats.fetched;
        self.migrated += stats.migrated;
        self.degraded += stats.degraded;
        self.failed += stats.failed;
        self.skipped += stats.skipped;
        if stats.fetch_error.is_some() {
            self.failed_types.push(record_type.to_string());
        }
        self.per_type.insert(record_type.to_string(), stats);
    }
}

/// Asset-only migration statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AssetStats {
    /// Asset values with a download URL.
    pub total: u64,
    /// Assets re-hosted.
    pub uploaded: u64,
    /// Assets whose transfer failed.
    pub failed: u64,
    /// Documents merge-updated.
    pub documents_updated: u64,
    /// Documents whose update was rejected.
    pub write_failures: u64,
    /// Record types whose fetch failed.
    pub failed_types: Vec<String>,
    /// Duration in seconds.
    pub duration_secs: f64,
}

type FetchResult = std::result::Result<Vec<SourceRecord>, String>;

#[derive(Debug, Default)]
struct RecordAssets {
    total: u64,
    uploaded: u64,
    updated: bool,
    write_failed: bool,
}

/// Migration pipeline.
pub struct Pipeline {
    config: MigrationConfig,
    source: Box<dyn RecordSource>,
    destination: Destination,
}

impl Pipeline {
    /// Creates a pipeline over an existing source and destination.
    pub fn new(
        config: MigrationConfig,
        source: Box<dyn RecordSource>,
        destination: Destination,
    ) -> Self {
        Self {
            config,
            source,
            destination,
        }
    }

    /// Creates a pipeline from configuration.
    ///
    /// A dry run without destination credentials uses in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AuthSetup`] if the signing key cannot be loaded
    /// or the destination credentials are rejected.
    pub async fn from_config(config: MigrationConfig) -> Result<Self> {
        let source = create_source(&config.source)?;
        let credentials = &config.destination.credentials;
        let destination = if config.options.dry_run
            && credentials.service_account.is_none()
            && credentials.access_token.is_none()
        {
            info!("Dry run without credentials - destination is not contacted");
            Destination::in_memory(&config.destination.bucket)
        } else {
            Destination::connect(&config.destination).await?
        };
        Ok(Self::new(config, source, destination))
    }

    fn converter(&self) -> FieldConverter {
        FieldConverter::new(self.transferer(), self.config.options.dry_run)
    }

    fn transferer(&self) -> AssetTransferer {
        AssetTransferer::new(
            self.destination.objects.clone(),
            self.config.options.asset_timeout(),
        )
    }

    /// Runs the full migration over every configured record type.
    ///
    /// Record and record-type failures are counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that make continuing pointless,
    /// such as unusable credentials.
    pub async fn run(&self) -> Result<MigrationStats> {
        let start = Instant::now();
        let mut stats = MigrationStats::default();
        let converter = self.converter();

        info!(
            "Starting migration from {} ({} record types{})",
            self.source.source_type(),
            self.config.record_types.len(),
            if self.config.options.dry_run {
                ", dry run"
            } else {
                ""
            }
        );

        for mapping in &self.config.record_types {
            let type_stats = self.migrate_type(mapping, &converter).await?;
            stats.add(&mapping.record_type, type_stats);
        }

        stats.duration_secs = start.elapsed().as_secs_f64();

        info!(
            "Migration complete: {} fetched, {} migrated, {} degraded, {} failed, {} skipped in {:.2}s ({:.0} records/sec)",
            stats.fetched,
            stats.migrated,
            stats.degraded,
            stats.failed,
            stats.skipped,
            stats.duration_secs,
            stats.throughput()
        );
        if !stats.failed_types.is_empty() {
            warn!("Record types not migrated: {}", stats.failed_types.join(", "));
        }

        Ok(stats)
    }

    /// Fetches a record type. The inner error is a non-fatal fetch failure.
    async fn fetch(&self, record_type: &str) -> Result<FetchResult> {
        match self.source.fetch_all(record_type).await {
            Ok(records) => Ok(Ok(records)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Failed to fetch {}: {}", record_type, e);
                Ok(Err(e.to_string()))
            }
        }
    }

    async fn migrate_type(
        &self,
        mapping: &RecordTypeMapping,
        converter: &FieldConverter,
    ) -> Result<TypeStats> {
        let collection = mapping.collection_name();
        let mut stats = TypeStats::default();
        info!("Processing {} -> {}", mapping.record_type, collection);

        let records = match self.fetch(&mapping.record_type).await? {
            Ok(records) => records,
            Err(e) => {
                stats.fetch_error = Some(e);
                return Ok(stats);
            }
        };
        stats.fetched = records.len() as u64;
        info!("Found {} {} records", records.len(), mapping.record_type);

        let collection = collection.as_str();
        let mut results = stream::iter(records)
            .map(|record| self.migrate_record(collection, converter, record))
            .buffer_unordered(self.config.options.workers.max(1));

        while let Some(result) = results.next().await {
            stats.record(&result?);
        }

        info!(
            "{}: {} migrated, {} degraded, {} failed, {} skipped",
            mapping.record_type, stats.migrated, stats.degraded, stats.failed, stats.skipped
        );
        Ok(stats)
    }

    async fn migrate_record(
        &self,
        collection: &str,
        converter: &FieldConverter,
        record: SourceRecord,
    ) -> Result<MigrationResult> {
        let converted = match converter.convert(&record).await {
            Ok(converted) => converted,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Failed to convert {}: {}", record.record_name, e);
                return Ok(MigrationResult::Failed(e.to_string()));
            }
        };

        if self.config.options.dry_run {
            info!("[DRY RUN] Would create: {}/{}", collection, record.record_name);
            return Ok(MigrationResult::Skipped);
        }

        match self
            .destination
            .documents
            .set(collection, &converted.document)
            .await
        {
            Ok(()) => {
                debug!("Created {}/{}", collection, record.record_name);
                if converted.is_degraded() {
                    Ok(MigrationResult::Degraded(converted.degraded_fields))
                } else {
                    Ok(MigrationResult::Migrated)
                }
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Failed to write {}/{}: {}", collection, record.record_name, e);
                Ok(MigrationResult::Failed(e.to_string()))
            }
        }
    }

    /// Re-hosts the configured asset fields of existing documents.
    ///
    /// Only successfully transferred fields are merge-updated; a failed
    /// transfer leaves the document field untouched.
    ///
    /// # Errors
    ///
    /// Returns an error only for failures that make continuing pointless.
    pub async fn run_assets(&self) -> Result<AssetStats> {
        let start = Instant::now();
        let mut stats = AssetStats::default();
        let transferer = self.transferer();

        for mapping in &self.config.record_types {
            if mapping.asset_fields.is_empty() {
                debug!("{} has no asset fields, skipping", mapping.record_type);
                continue;
            }
            let collection = mapping.collection_name();
            info!("Processing assets of {} -> {}", mapping.record_type, collection);

            let records = match self.fetch(&mapping.record_type).await? {
                Ok(records) => records,
                Err(_) => {
                    stats.failed_types.push(mapping.record_type.clone());
                    continue;
                }
            };
            info!("Found {} {} records", records.len(), mapping.record_type);

            let collection = collection.as_str();
            let mut results = stream::iter(records)
                .map(|record| self.migrate_record_assets(collection, mapping, &transferer, record))
                .buffer_unordered(self.config.options.workers.max(1));

            while let Some(result) = results.next().await {
                let result = result?;
                stats.total += result.total;
                stats.uploaded += result.uploaded;
                if !self.config.options.dry_run {
                    stats.failed += result.total - result.uploaded;
                }
                stats.documents_updated += u64::from(result.updated);
                stats.write_failures += u64::from(result.write_failed);
            }
        }

        stats.duration_secs = start.elapsed().as_secs_f64();
        info!("Summary: {}/{} assets uploaded", stats.uploaded, stats.total);

        Ok(stats)
    }

    async fn migrate_record_assets(
        &self,
        collection: &str,
        mapping: &RecordTypeMapping,
        transferer: &AssetTransferer,
        record: SourceRecord,
    ) -> Result<RecordAssets> {
        let mut result = RecordAssets::default();
        let mut updates = Document::new(record.record_name.clone());

        for field in &mapping.asset_fields {
            let Some(value) = record.fields.get(field) else {
                continue;
            };
            if !value.tag.is_asset() {
                continue;
            }
            let Some(url) = value.download_url() else {
                warn!("No download URL for {}/{}", record.record_name, field);
                continue;
            };
            result.total += 1;

            if self.config.options.dry_run {
                info!("[DRY RUN] Would download {} of {}", field, record.record_name);
                continue;
            }

            match transferer.transfer(url, &record.record_name, field).await {
                Ok(reference) => {
                    result.uploaded += 1;
                    updates
                        .fields
                        .insert(field.clone(), FieldValue::String(reference));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Failed {} of {}: {}", field, record.record_name, e),
            }
        }

        if updates.fields.is_empty() {
            return Ok(result);
        }

        match self.destination.documents.merge(collection, &updates).await {
            Ok(()) => {
                info!(
                    "Updated {}/{}: {} fields",
                    collection,
                    record.record_name,
                    updates.fields.len()
                );
                result.updated = true;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Failed to update {}/{}: {}", collection, record.record_name, e);
                result.write_failed = true;
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("source", &self.source.source_type())
            .field("record_types", &self.config.record_types.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
