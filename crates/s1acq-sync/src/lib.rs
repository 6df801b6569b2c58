//! Scrape pipeline orchestration: config, catalog reconciliation, emission and job submission.

pub mod catalog;
pub mod emit;
pub mod ipf;
pub mod mozart;
pub mod reconcile;
pub mod report;
pub mod submit;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use s1acq_adapters::{
    adapter_for_source, asf, format_bound, normalize_batch, polygon_to_geojson, polygon_to_wkt,
    scihub, scrape_window, AdapterSettings, ScrapePurpose, ScrapeQuery, UnknownPurpose,
};
use s1acq_core::{ReconciliationVerdict, SourceKind};
use s1acq_storage::{BrowseRenderer, DatasetStore, HttpClientConfig, HttpFetcher, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use catalog::{acquisition_index, CatalogAcquisition, CatalogClient};
pub use emit::{DatasetEmitter, EmitMode, EmitOutcome, IngestSubmitter};
pub use ipf::{scrape_ipf, IpfError, IpfRequest, IpfScraper};
pub use mozart::{JobPayload, JobSubmitter, MozartClient, SubmitError};
pub use reconcile::{reconcile, Deprecator, ReconciliationEngine, ReconciliationOutcome};
pub use report::StatusReport;

pub const CRATE_NAME: &str = "s1acq-sync";

/// Invalid invocation, detected before any network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--ingest and --create-only are mutually exclusive")]
    ConflictingEmitModes,
    #[error("none of start time, delta of hours or delta of days was given")]
    MissingTemporalInput,
    #[error(
        "only one of start time ({starttime:?}), delta of hours ({hours:?}) \
         or delta of days ({days:?}) may be given"
    )]
    ConflictingTemporalInput {
        starttime: Option<String>,
        hours: Option<i64>,
        days: Option<i64>,
    },
    #[error(transparent)]
    UnknownPurpose(#[from] UnknownPurpose),
    #[error("invalid polygon: {0}")]
    Polygon(String),
    #[error("window start {start} is not before end {end}")]
    EmptyWindow { start: String, end: String },
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error("invalid acquisition metadata: {0}")]
    Metadata(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: SourceKind,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub page_delay_secs: u64,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig {
                    source: SourceKind::Scihub,
                    search_url: Some(scihub::DEFAULT_SEARCH_URL.to_string()),
                    page_size: Some(scihub::DEFAULT_PAGE_SIZE),
                    page_delay_secs: 3,
                },
                SourceConfig {
                    source: SourceKind::Asf,
                    search_url: Some(asf::DEFAULT_SEARCH_URL.to_string()),
                    page_size: None,
                    page_delay_secs: 0,
                },
            ],
        }
    }
}

impl SourceRegistry {
    pub fn get(&self, source: SourceKind) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source == source)
    }

    /// Reads the registry; a missing file falls back to the built-in defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "source registry not found; using built-in defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub grq_es_url: String,
    pub mozart_url: String,
    pub scihub_search_url: Option<String>,
    pub asf_search_url: Option<String>,
    pub scihub_credentials: Option<(String, String)>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub sources_file: PathBuf,
    pub output_dir: PathBuf,
    pub dataset_version: String,
    pub job_release: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let credentials = (std::env::var("SCIHUB_USER"), std::env::var("SCIHUB_PASSWORD"));
        let scihub_credentials = match credentials {
            (Ok(user), Ok(password)) => Some((user, password)),
            _ => None,
        };
        Self {
            grq_es_url: var("GRQ_ES_URL", "http://localhost:9200"),
            mozart_url: var("MOZART_URL", "https://localhost"),
            scihub_search_url: std::env::var("SCIHUB_SEARCH_URL").ok(),
            asf_search_url: std::env::var("ASF_SEARCH_URL").ok(),
            scihub_credentials,
            user_agent: var("S1ACQ_USER_AGENT", "s1acq/0.1"),
            http_timeout_secs: std::env::var("S1ACQ_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(180),
            accept_invalid_certs: std::env::var("S1ACQ_INSECURE_TLS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sources_file: std::env::var("S1ACQ_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            output_dir: std::env::var("S1ACQ_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            dataset_version: var("S1ACQ_DATASET_VERSION", "v2.0"),
            job_release: var("S1ACQ_JOB_RELEASE", "master"),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs: self.accept_invalid_certs,
            ..Default::default()
        }
    }

    pub fn search_url_override(&self, source: SourceKind) -> Option<&str> {
        match source {
            SourceKind::Scihub => self.scihub_search_url.as_deref(),
            SourceKind::Asf => self.asf_search_url.as_deref(),
        }
    }

    pub fn catalog_index(&self) -> String {
        acquisition_index(&self.dataset_version)
    }
}

/// Parses an ISO-8601 window bound given on the command line.
pub fn parse_bound(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    s1acq_adapters::normalize::parse_catalog_utc(value)
        .ok_or_else(|| ConfigError::Timestamp(value.to_string()))
}

/// Polygon input in both renderings: WKT for source queries, GeoJSON for the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    pub wkt: String,
    pub geojson: JsonValue,
}

impl AreaOfInterest {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let to_config = |e: s1acq_adapters::AdapterError| ConfigError::Polygon(e.to_string());
        Ok(Self {
            wkt: polygon_to_wkt(input).map_err(to_config)?,
            geojson: polygon_to_geojson(input).map_err(to_config)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub source: SourceKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub purpose: ScrapePurpose,
    pub area: Option<AreaOfInterest>,
    pub aoi_name: Option<String>,
    pub emit_mode: EmitMode,
    pub report: bool,
    pub browse: bool,
}

impl ScrapeRequest {
    pub fn new(
        source: SourceKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::EmptyWindow {
                start: format_bound(&start),
                end: format_bound(&end),
            });
        }
        Ok(Self {
            source,
            start,
            end,
            purpose: ScrapePurpose::Scrape,
            area: None,
            aoi_name: None,
            emit_mode: EmitMode::ReportOnly,
            report: false,
            browse: false,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: SourceKind,
    pub reported_total: Option<u64>,
    pub pages: usize,
    pub scraped: usize,
    pub dropped: usize,
    pub already_present: usize,
    pub deprecated: usize,
    pub new: usize,
    pub superseded: usize,
    pub emitted: Vec<String>,
    pub still_missing: Vec<String>,
    pub report_dir: Option<String>,
}

pub struct ScrapePipeline {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    submitter: Arc<dyn JobSubmitter>,
}

impl ScrapePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_transport(config, Arc::new(http)))
    }

    pub fn with_transport(config: PipelineConfig, transport: Arc<dyn Transport>) -> Self {
        let submitter = Arc::new(MozartClient::new(&config.mozart_url, transport.clone()));
        Self {
            config,
            transport,
            submitter,
        }
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn JobSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> CatalogClient {
        CatalogClient::new(
            &self.config.grq_es_url,
            self.config.catalog_index(),
            self.transport.clone(),
        )
    }

    pub fn submitter(&self) -> &dyn JobSubmitter {
        self.submitter.as_ref()
    }

    pub fn ipf_scraper(&self) -> IpfScraper {
        let asf_search_url = self
            .config
            .search_url_override(SourceKind::Asf)
            .unwrap_or(asf::DEFAULT_SEARCH_URL);
        IpfScraper::new(self.transport.clone(), asf_search_url)
            .with_credentials(self.config.scihub_credentials.clone())
    }

    pub async fn run_once(&self, request: &ScrapeRequest) -> Result<ScrapeRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "scrape_run",
            %run_id,
            source = %request.source,
            purpose = %request.purpose
        );
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: &ScrapeRequest) -> Result<ScrapeRunSummary> {
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.sources_file).await?;
        let source_config = registry.get(request.source);

        let mut settings = AdapterSettings::new(
            self.config
                .search_url_override(request.source)
                .or_else(|| source_config.and_then(|s| s.search_url.as_deref()))
                .unwrap_or(match request.source {
                    SourceKind::Scihub => scihub::DEFAULT_SEARCH_URL,
                    SourceKind::Asf => asf::DEFAULT_SEARCH_URL,
                }),
        );
        settings.page_size = source_config.and_then(|s| s.page_size);
        if request.source == SourceKind::Scihub {
            settings.credentials = self.config.scihub_credentials.clone();
        }
        let page_delay = Duration::from_secs(source_config.map_or(0, |s| s.page_delay_secs));
        let adapter = adapter_for_source(request.source, settings);

        let query = ScrapeQuery::new(request.start, request.end, request.purpose)
            .with_polygon(request.area.as_ref().map(|a| a.wkt.clone()));
        let window = scrape_window(adapter.as_ref(), self.transport.as_ref(), &query, page_delay)
            .await
            .with_context(|| {
                format!(
                    "scraping {} for {} - {}",
                    request.source,
                    query_start(&query),
                    query_end(&query)
                )
            })?;
        let batch = normalize_batch(adapter.as_ref(), &window.records);
        let scraped = batch.records.len();
        info!(
            raw = window.records.len(),
            normalized = scraped,
            dropped = batch.dropped,
            "normalized search results"
        );

        let catalog = self.catalog();
        let polygon = request.area.as_ref().map(|a| &a.geojson);
        let index = catalog
            .existing_index(&request.start, &request.end, polygon)
            .await
            .context("reading existing acquisitions from catalog")?;

        let outcome = reconcile(&index, batch.records, &catalog).await;
        let status = StatusReport::new(
            &query_start(&query),
            &query_end(&query),
            catalog.index(),
            outcome.classified.iter().map(|c| &c.record),
            outcome.new_records(),
        );
        status.log();

        let store = DatasetStore::new(&self.config.output_dir);
        let version = &self.config.dataset_version;
        let emitter = DatasetEmitter::new(store.clone(), version, self.transport.clone())
            .with_browse(request.browse.then(BrowseRenderer::default));
        let ingest =
            IngestSubmitter::new(self.submitter.clone(), version, &self.config.job_release);
        let emitted =
            emit::emit_missing(request.emit_mode, outcome.new_records(), &emitter, &ingest).await;

        let still_missing = match request.emit_mode {
            EmitMode::ReportOnly => outcome
                .new_records()
                .map(|r| r.data_product_name.clone())
                .collect(),
            EmitMode::Create | EmitMode::Ingest => emitted.still_missing.clone(),
        };

        let report_dir = if request.report {
            let written = report::write_report_dataset(
                &store,
                &query_start(&query),
                &query_end(&query),
                polygon,
                &still_missing,
                request.aoi_name.as_deref(),
            )
            .await?;
            Some(written.dir.display().to_string())
        } else {
            None
        };

        let summary = ScrapeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: request.source,
            reported_total: window.reported_total,
            pages: window.pages,
            scraped,
            dropped: batch.dropped,
            already_present: outcome.count(ReconciliationVerdict::AlreadyPresent),
            deprecated: outcome.count(ReconciliationVerdict::Deprecated),
            new: outcome.count(ReconciliationVerdict::New),
            superseded: outcome.superseded.len(),
            emitted: emitted.emitted,
            still_missing,
            report_dir,
        };
        info!(
            new = summary.new,
            already_present = summary.already_present,
            deprecated = summary.deprecated,
            still_missing = summary.still_missing.len(),
            "scrape run finished"
        );
        Ok(summary)
    }
}

fn query_start(query: &ScrapeQuery) -> String {
    format_bound(&query.start)
}

fn query_end(query: &ScrapeQuery) -> String {
    format_bound(&query.end)
}

pub async fn run_scrape_once_from_env(request: &ScrapeRequest) -> Result<ScrapeRunSummary> {
    let pipeline = ScrapePipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use s1acq_storage::{MemoryTransport, Method};
    use serde_json::json;
    use tempfile::tempdir;

    const SCIHUB: &str = "https://scihub.test/apihub/search";
    const ES: &str = "http://grq.test:9200";
    const KNOWN_TITLE: &str = "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D";
    const NEW_TITLE: &str = "S1B_IW_SLC__1SDV_20170101T015012_20170101T015039_003638_006384_8C21";

    fn fixture(rel: &str) -> String {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        std::fs::read_to_string(root.join(rel)).unwrap()
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        let sources = dir.join("sources.yaml");
        std::fs::write(
            &sources,
            format!(
                "sources:\n  - source: esa_scihub\n    search_url: {SCIHUB}\n    \
                 page_size: 100\n    page_delay_secs: 0\n"
            ),
        )
        .unwrap();
        PipelineConfig {
            grq_es_url: ES.to_string(),
            mozart_url: "https://mozart.test".to_string(),
            scihub_search_url: None,
            asf_search_url: None,
            scihub_credentials: None,
            user_agent: "s1acq-test".to_string(),
            http_timeout_secs: 5,
            accept_invalid_certs: false,
            sources_file: sources,
            output_dir: dir.join("out"),
            dataset_version: "v2.0".to_string(),
            job_release: "master".to_string(),
        }
    }

    fn catalog_responses(transport: &MemoryTransport) {
        let known = json!({
            "_index": "grq_v2.0_acquisition-s1-iw_slc",
            "_id": format!("acquisition-{KNOWN_TITLE}-esa_scihub"),
            "_source": {"metadata": {
                "id": "1fa7d1a8-3d5d-4a5d-9d21-6d2c6a64d0b5",
                "title": KNOWN_TITLE,
                "missiondatatakeid": "43390",
                "ingestiondate": "2015-09-09T20:47:23.561Z"
            }}
        });
        transport.respond_json(
            Method::Post,
            &format!("{ES}/grq_v2.0_acquisition-s1-iw_slc/_search"),
            &json!({"_scroll_id": "c1", "hits": {"total": 1, "hits": [known]}}),
        );
        transport.respond_json(
            Method::Post,
            &format!("{ES}/_search/scroll"),
            &json!({"hits": {"hits": []}}),
        );
    }

    fn request(start: &str, end: &str) -> ScrapeRequest {
        let (start, end) = (parse_bound(start).unwrap(), parse_bound(end).unwrap());
        ScrapeRequest::new(SourceKind::Scihub, start, end).unwrap()
    }

    #[tokio::test]
    async fn scrape_run_creates_dataset_for_the_missing_acquisition_only() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond(Method::Get, SCIHUB, 200, fixture("fixtures/scihub/sample/page_1.json"));
        transport.respond_json(
            Method::Get,
            SCIHUB,
            &json!({"feed": {"opensearch:totalResults": "500"}}),
        );
        catalog_responses(&transport);

        let pipeline = ScrapePipeline::with_transport(test_config(dir.path()), transport.clone());
        let mut req = request("2015-09-09T00:00:00Z", "2017-01-02T00:00:00Z");
        req.emit_mode = EmitMode::Create;

        let summary = pipeline.run_once(&req).await.unwrap();

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.reported_total, Some(500));
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.already_present, 1);
        assert_eq!(summary.new, 1);
        assert_eq!(summary.emitted, vec!["7c3e0d52-8e86-4a4f-b0a7-0a6f4e2d9c11".to_string()]);
        assert!(summary.still_missing.is_empty());

        let dataset_id = format!("acquisition-{NEW_TITLE}-esa_scihub");
        let dataset_dir = dir.path().join("out").join(&dataset_id);
        let entries = std::fs::read_dir(&dataset_dir).unwrap().count();
        assert_eq!(entries, 2);
        let read = |suffix: &str| -> JsonValue {
            let path = dataset_dir.join(format!("{dataset_id}.{suffix}"));
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
        };
        let dataset = read("dataset.json");
        let met = read("met.json");
        assert_eq!(dataset["label"], met["id"]);
        assert_eq!(met["track_number"], 112);
        assert_eq!(met["direction"], "dsc");
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn report_only_run_lists_missing_products_in_report_dataset() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond(Method::Get, SCIHUB, 200, fixture("fixtures/scihub/sample/page_1.json"));
        transport.respond_json(Method::Get, SCIHUB, &json!({"feed": {}}));
        catalog_responses(&transport);

        let pipeline = ScrapePipeline::with_transport(test_config(dir.path()), transport);
        let mut req = request("2015-09-09T00:00:00Z", "2017-01-02T00:00:00Z");
        req.report = true;

        let summary = pipeline.run_once(&req).await.unwrap();

        assert!(summary.emitted.is_empty());
        assert_eq!(
            summary.still_missing,
            vec![format!("acquisition-{NEW_TITLE}")]
        );
        let report_dir = PathBuf::from(summary.report_dir.unwrap());
        assert!(report_dir
            .ends_with("report-daily_2015-09-09T00:00:00.000Z_2017-01-02T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn catalog_failure_fails_the_run() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_json(Method::Get, SCIHUB, &json!({"feed": {}}));
        transport.respond(Method::Post, ES, 503, "unavailable");

        let pipeline = ScrapePipeline::with_transport(test_config(dir.path()), transport);
        let err = pipeline
            .run_once(&request("2015-09-09T00:00:00Z", "2015-09-10T00:00:00Z"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("catalog"));
    }

    #[tokio::test]
    async fn missing_registry_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let registry = SourceRegistry::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(registry.get(SourceKind::Scihub).unwrap().page_delay_secs, 3);
        assert_eq!(registry.get(SourceKind::Asf).unwrap().page_size, None);
    }

    #[test]
    fn request_rejects_empty_window_and_bad_polygon() {
        let start = parse_bound("2019-03-02T00:00:00Z").unwrap();
        assert!(matches!(
            ScrapeRequest::new(SourceKind::Asf, start, start),
            Err(ConfigError::EmptyWindow { .. })
        ));
        assert!(matches!(AreaOfInterest::parse("[[0, 0]]"), Err(ConfigError::Polygon(_))));
        assert!(matches!(parse_bound("yesterday"), Err(ConfigError::Timestamp(_))));
    }
}
