//! Source adapter contracts, per-source adapters, and the paginated scrape loop.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use geo::{LineString, MultiPolygon, Polygon};
use s1acq_core::{AcquisitionRecord, SourceKind};
use s1acq_storage::{FetchError, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info};
use wkt::ToWkt;

pub mod asf;
pub mod normalize;
pub mod scihub;

pub use asf::AsfAdapter;
pub use normalize::NormalizationError;
pub use scihub::ScihubAdapter;

pub const CRATE_NAME: &str = "s1acq-adapters";

/// Keys owned by typed `AcquisitionRecord` fields; never carried in the passthrough map.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "title",
    "data_product_name",
    "archive_filename",
    "sensingStart",
    "sensingStop",
    "track_number",
    "trackNumber",
    "orbitNumber",
    "platform",
    "direction",
    "location",
    "bbox",
    "footprint",
    "missiondatatakeid",
    "ingestiondate",
    "source",
    "query_api",
    "processing_version",
    "download_url",
    "icon",
];

/// One untouched search result, tagged by the catalog it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSourceRecord {
    Scihub(JsonValue),
    Asf(JsonValue),
}

impl RawSourceRecord {
    pub fn source(&self) -> SourceKind {
        match self {
            RawSourceRecord::Scihub(_) => SourceKind::Scihub,
            RawSourceRecord::Asf(_) => SourceKind::Asf,
        }
    }

    pub fn json(&self) -> &JsonValue {
        match self {
            RawSourceRecord::Scihub(value) | RawSourceRecord::Asf(value) => value,
        }
    }
}

pub fn normalize(raw: &RawSourceRecord) -> Result<AcquisitionRecord, NormalizationError> {
    match raw {
        RawSourceRecord::Scihub(entry) => scihub::normalize_entry(entry),
        RawSourceRecord::Asf(granule) => asf::normalize_granule(granule),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapePurpose {
    Scrape,
    Validate,
    AoiScrape,
}

impl ScrapePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapePurpose::Scrape => "scrape",
            ScrapePurpose::Validate => "validate",
            ScrapePurpose::AoiScrape => "aoi_scrape",
        }
    }

    /// Catalog field the window bounds apply to.
    pub fn time_field(&self) -> &'static str {
        match self {
            ScrapePurpose::Scrape => "ingestiondate",
            ScrapePurpose::Validate | ScrapePurpose::AoiScrape => "beginposition",
        }
    }
}

impl fmt::Display for ScrapePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown scrape purpose `{0}` (expected scrape, validate or aoi_scrape)")]
pub struct UnknownPurpose(pub String);

impl FromStr for ScrapePurpose {
    type Err = UnknownPurpose;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape" => Ok(ScrapePurpose::Scrape),
            "validate" => Ok(ScrapePurpose::Validate),
            "aoi_scrape" => Ok(ScrapePurpose::AoiScrape),
            other => Err(UnknownPurpose(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub purpose: ScrapePurpose,
    pub polygon_wkt: Option<String>,
}

impl ScrapeQuery {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, purpose: ScrapePurpose) -> Self {
        Self {
            start,
            end,
            purpose,
            polygon_wkt: None,
        }
    }

    pub fn with_polygon(mut self, polygon_wkt: Option<String>) -> Self {
        self.polygon_wkt = polygon_wkt;
        self
    }
}

/// `2015-09-09T00:00:00.000Z`
pub fn format_bound(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    Offset { page_size: usize },
    Single,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub reported_total: Option<u64>,
    pub records: Vec<RawSourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub search_url: String,
    pub page_size: Option<usize>,
    pub credentials: Option<(String, String)>,
}

impl AdapterSettings {
    pub fn new(search_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            page_size: None,
            credentials: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {kind} response: {message}")]
    Shape { kind: SourceKind, message: String },
    #[error("unable to parse polygon {input}: {message}")]
    Polygon { input: String, message: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;
    fn paging(&self) -> Paging;

    async fn fetch_page(
        &self,
        transport: &dyn Transport,
        query: &ScrapeQuery,
        offset: usize,
    ) -> Result<SourcePage, AdapterError>;

    fn normalize(&self, raw: &RawSourceRecord) -> Result<AcquisitionRecord, NormalizationError> {
        normalize(raw)
    }
}

pub fn adapter_for_source(source: SourceKind, settings: AdapterSettings) -> Box<dyn SourceAdapter> {
    match source {
        SourceKind::Scihub => Box::new(ScihubAdapter::new(settings)),
        SourceKind::Asf => Box::new(AsfAdapter::new(settings)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScrapedWindow {
    pub reported_total: Option<u64>,
    pub pages: usize,
    pub records: Vec<RawSourceRecord>,
}

/// Pages through the source until a page comes back empty. The reported total
/// is informational only.
pub async fn scrape_window(
    adapter: &dyn SourceAdapter,
    transport: &dyn Transport,
    query: &ScrapeQuery,
    page_delay: Duration,
) -> Result<ScrapedWindow, AdapterError> {
    let mut window = ScrapedWindow::default();
    let mut offset = 0usize;

    loop {
        let page = adapter.fetch_page(transport, query, offset).await?;
        window.pages += 1;
        if window.reported_total.is_none() {
            window.reported_total = page.reported_total;
        }
        let count = page.records.len();
        info!(
            source = %adapter.source(),
            offset,
            count,
            reported_total = ?window.reported_total,
            "fetched search page"
        );
        if count == 0 {
            break;
        }
        offset += count;
        window.records.extend(page.records);

        if adapter.paging() == Paging::Single {
            break;
        }
        tokio::time::sleep(page_delay).await;
    }

    Ok(window)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<AcquisitionRecord>,
    pub dropped: usize,
}

/// Normalizes every raw record; a record that fails is logged and dropped.
pub fn normalize_batch(adapter: &dyn SourceAdapter, raws: &[RawSourceRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for raw in raws {
        match adapter.normalize(raw) {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                batch.dropped += 1;
                error!(
                    source = %raw.source(),
                    error = %err,
                    raw = %raw.json(),
                    batch_size = raws.len(),
                    "failed to normalize search result; dropping it"
                );
                let raw_batch: Vec<serde_json::Value> =
                    raws.iter().map(|r| r.json().clone()).collect();
                debug!(
                    batch = %serde_json::Value::Array(raw_batch),
                    "batch containing dropped record"
                );
            }
        }
    }
    batch
}

fn polygon_error(input: &str, message: impl ToString) -> AdapterError {
    AdapterError::Polygon {
        input: input.to_string(),
        message: message.to_string(),
    }
}

fn polygon_ring(input: &str) -> Result<Vec<[f64; 2]>, AdapterError> {
    let value: JsonValue = serde_json::from_str(input).map_err(|e| polygon_error(input, e))?;
    let ring_value = match &value {
        JsonValue::Object(obj) => obj
            .get("coordinates")
            .and_then(|c| c.get(0))
            .ok_or_else(|| polygon_error(input, "missing coordinates"))?,
        JsonValue::Array(items) => match items.first() {
            Some(first) if first.get(0).is_some_and(JsonValue::is_array) => first,
            _ => &value,
        },
        _ => return Err(polygon_error(input, "expected an object or a coordinate list")),
    };
    let ring: Vec<[f64; 2]> =
        serde_json::from_value(ring_value.clone()).map_err(|e| polygon_error(input, e))?;
    if ring.len() < 3 {
        return Err(polygon_error(input, "a polygon ring needs at least three points"));
    }
    Ok(ring)
}

/// Converts a GeoJSON polygon (full object or bare coordinate ring) into a
/// single-member `MULTIPOLYGON` WKT string for search queries.
pub fn polygon_to_wkt(input: &str) -> Result<String, AdapterError> {
    let ring = polygon_ring(input)?;
    let exterior = LineString::from(ring.into_iter().map(|[x, y]| (x, y)).collect::<Vec<_>>());
    let polygon = MultiPolygon::new(vec![Polygon::new(exterior, vec![])]);
    Ok(polygon.wkt_string())
}

/// Same inputs as `polygon_to_wkt`, rendered as a GeoJSON `Polygon` for catalog geo_shape filters.
pub fn polygon_to_geojson(input: &str) -> Result<JsonValue, AdapterError> {
    let ring = polygon_ring(input)?;
    Ok(serde_json::json!({"type": "Polygon", "coordinates": [ring]}))
}
