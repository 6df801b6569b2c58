//! Classifies scraped records against the catalog snapshot.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s1acq_core::{AcquisitionRecord, CatalogEntry, ExistingCatalogIndex, ReconciliationVerdict};
use s1acq_storage::FetchError;
use tracing::{debug, info, warn};

/// Tags a superseded catalog document so downstream consumers ignore it.
#[async_trait]
pub trait Deprecator: Send + Sync {
    async fn deprecate(&self, entry: &CatalogEntry) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub record: AcquisitionRecord,
    pub verdict: ReconciliationVerdict,
    /// Catalog entry this record replaces (`SupersededByNewer`).
    pub supersedes: Option<CatalogEntry>,
}

/// Missing dates on either side never count as newer.
fn is_strictly_newer(candidate: Option<DateTime<Utc>>, existing: Option<DateTime<Utc>>) -> bool {
    match (candidate, existing) {
        (Some(candidate), Some(existing)) => candidate > existing,
        _ => false,
    }
}

pub struct ReconciliationEngine<'a> {
    index: &'a ExistingCatalogIndex,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(index: &'a ExistingCatalogIndex) -> Self {
        Self { index }
    }

    pub fn classify(
        &self,
        record: &AcquisitionRecord,
    ) -> (ReconciliationVerdict, Option<&'a CatalogEntry>) {
        if self.index.contains_id(&record.id) || self.index.contains_title(&record.title) {
            return (ReconciliationVerdict::AlreadyPresent, None);
        }
        if let Some(data_take) = &record.mission_data_take_id {
            if let Some(existing) = self.index.entry_for_data_take(data_take) {
                if is_strictly_newer(record.ingestion_date, existing.ingestion_date) {
                    return (ReconciliationVerdict::New, Some(existing));
                }
                return (ReconciliationVerdict::Deprecated, None);
            }
        }
        (ReconciliationVerdict::New, None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationOutcome {
    pub classified: Vec<Classified>,
    pub superseded: Vec<CatalogEntry>,
    pub failed_deprecations: Vec<CatalogEntry>,
}

impl ReconciliationOutcome {
    pub fn count(&self, verdict: ReconciliationVerdict) -> usize {
        self.classified.iter().filter(|c| c.verdict == verdict).count()
    }

    pub fn new_records(&self) -> impl Iterator<Item = &AcquisitionRecord> {
        self.classified
            .iter()
            .filter(|c| c.verdict == ReconciliationVerdict::New)
            .map(|c| &c.record)
    }
}

/// Classifies every record; each superseded document is deprecated at most once
/// and a failed deprecation leaves the classification unchanged.
pub async fn reconcile(
    index: &ExistingCatalogIndex,
    records: Vec<AcquisitionRecord>,
    deprecator: &dyn Deprecator,
) -> ReconciliationOutcome {
    let engine = ReconciliationEngine::new(index);
    let mut outcome = ReconciliationOutcome::default();
    let mut deprecated_docs = BTreeSet::new();

    for record in records {
        let (verdict, supersedes) = engine.classify(&record);
        let supersedes = supersedes.cloned();

        if let Some(entry) = &supersedes {
            if deprecated_docs.insert(entry.doc_id.clone()) {
                match deprecator.deprecate(entry).await {
                    Ok(()) => {
                        info!(
                            doc_id = %entry.doc_id,
                            replaced_by = %record.id,
                            verdict = %ReconciliationVerdict::SupersededByNewer,
                            "catalog entry superseded by newer ingestion"
                        );
                        outcome.superseded.push(entry.clone());
                    }
                    Err(err) => {
                        warn!(
                            doc_id = %entry.doc_id,
                            error = %err,
                            "failed to deprecate superseded catalog entry"
                        );
                        outcome.failed_deprecations.push(entry.clone());
                    }
                }
            }
        }

        debug!(id = %record.id, %verdict, "classified acquisition");
        outcome.classified.push(Classified {
            record,
            verdict,
            supersedes,
        });
    }
    outcome
}
