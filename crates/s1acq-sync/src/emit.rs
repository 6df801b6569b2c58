//! Emission of missing acquisitions: dataset directories or ingest jobs.

use std::sync::Arc;

use anyhow::Context;
use s1acq_core::{AcquisitionRecord, DatasetDescriptor};
use s1acq_storage::{BrowseRenderer, DatasetStore, HttpRequest, Transport, WrittenDataset};
use tracing::{error, info, warn};

use crate::mozart::{JobPayload, JobSubmitter};
use crate::ConfigError;

pub const INGEST_JOB_TYPE: &str = "job-ingest_acquisition_dataset";
pub const INGEST_QUEUE: &str = "factotum-job_worker-small";
pub const INGEST_PRIORITY: u8 = 5;
pub const DATASETS_CFG: &str = "datasets.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitMode {
    /// Write dataset directories locally.
    Create,
    /// Hand each record to an ingest job.
    Ingest,
    /// Classify and report only.
    ReportOnly,
}

impl EmitMode {
    pub fn from_flags(ingest: bool, create_only: bool) -> Result<Self, ConfigError> {
        match (ingest, create_only) {
            (true, true) => Err(ConfigError::ConflictingEmitModes),
            (true, false) => Ok(EmitMode::Ingest),
            (false, true) => Ok(EmitMode::Create),
            (false, false) => Ok(EmitMode::ReportOnly),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOutcome {
    pub emitted: Vec<String>,
    pub still_missing: Vec<String>,
}

pub struct DatasetEmitter {
    store: DatasetStore,
    dataset_version: String,
    browse: Option<BrowseRenderer>,
    transport: Arc<dyn Transport>,
}

impl DatasetEmitter {
    pub fn new(
        store: DatasetStore,
        dataset_version: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            dataset_version: dataset_version.into(),
            browse: None,
            transport,
        }
    }

    pub fn with_browse(mut self, renderer: Option<BrowseRenderer>) -> Self {
        self.browse = renderer;
        self
    }

    pub async fn emit(&self, record: &AcquisitionRecord) -> anyhow::Result<WrittenDataset> {
        let written = self
            .store
            .write_acquisition(record, &self.dataset_version)
            .await
            .with_context(|| format!("creating dataset for {}", record.id))?;

        if let (Some(renderer), Some(icon)) = (&self.browse, &record.icon) {
            self.transport
                .execute(HttpRequest::head(icon).retry_transient())
                .await?
                .error_for_status()
                .with_context(|| format!("browse image for {} is not available", record.id))?;
            renderer
                .render(self.transport.as_ref(), icon, &written.dir)
                .await
                .with_context(|| format!("rendering browse images for {}", record.id))?;
        }
        info!(
            dataset_id = %written.dataset_id,
            dir = %written.dir.display(),
            "created acquisition dataset"
        );
        Ok(written)
    }
}

pub struct IngestSubmitter {
    submitter: Arc<dyn JobSubmitter>,
    dataset_version: String,
    release: String,
}

impl IngestSubmitter {
    pub fn new(
        submitter: Arc<dyn JobSubmitter>,
        dataset_version: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        Self {
            submitter,
            dataset_version: dataset_version.into(),
            release: release.into(),
        }
    }

    pub fn payload(&self, record: &AcquisitionRecord) -> anyhow::Result<JobPayload> {
        let dataset = DatasetDescriptor::for_record(record, &self.dataset_version);
        let dataset_id = record.dataset_id();
        let job_name = format!("{INGEST_JOB_TYPE}-{dataset_id}");
        Ok(JobPayload::new(INGEST_JOB_TYPE, &self.release, INGEST_QUEUE, INGEST_PRIORITY)
            .named(job_name.strip_prefix("job-").unwrap_or(&job_name))
            .param("dataset_id", dataset_id.clone())
            .param("ds_cfg", DATASETS_CFG)
            .param("dataset", serde_json::to_value(&dataset).context("serializing dataset json")?)
            .param("met", serde_json::to_value(record).context("serializing met json")?))
    }

    pub async fn submit(&self, record: &AcquisitionRecord) -> anyhow::Result<String> {
        let payload = self.payload(record)?;
        let job_id = self
            .submitter
            .submit(&payload)
            .await
            .with_context(|| format!("submitting ingest job for {}", record.id))?;
        info!(id = %record.id, %job_id, "submitted ingest job");
        Ok(job_id)
    }
}

/// Emits every record, logging and collecting failures instead of stopping.
pub async fn emit_missing<'a>(
    mode: EmitMode,
    records: impl IntoIterator<Item = &'a AcquisitionRecord>,
    emitter: &DatasetEmitter,
    ingest: &IngestSubmitter,
) -> EmitOutcome {
    let mut outcome = EmitOutcome::default();
    for record in records {
        let result = match mode {
            EmitMode::ReportOnly => continue,
            EmitMode::Create => emitter.emit(record).await.map(|w| w.dataset_id),
            EmitMode::Ingest => ingest.submit(record).await,
        };
        match result {
            Ok(_) => outcome.emitted.push(record.id.clone()),
            Err(err) => {
                error!(id = %record.id, error = ?err, "failed to emit acquisition");
                outcome.still_missing.push(record.data_product_name.clone());
            }
        }
    }
    if !outcome.still_missing.is_empty() {
        warn!(count = outcome.still_missing.len(), "acquisitions still missing after emission");
    }
    outcome
}
