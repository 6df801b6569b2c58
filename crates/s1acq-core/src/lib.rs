//! Canonical acquisition model and catalog snapshot types for s1acq.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "s1acq-core";

/// Source catalog an acquisition was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "esa_scihub")]
    Scihub,
    #[serde(rename = "asf")]
    Asf,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Scihub => "esa_scihub",
            SourceKind::Asf => "asf",
        }
    }

    pub fn query_api(&self) -> &'static str {
        match self {
            SourceKind::Scihub => "opensearch",
            SourceKind::Asf => "asf_api_search",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Dsc,
}

impl Direction {
    pub fn from_catalog(value: &str) -> Option<Self> {
        match value {
            "ASCENDING" => Some(Direction::Asc),
            "DESCENDING" => Some(Direction::Dsc),
            _ => None,
        }
    }
}

/// Relates absolute orbit numbers to relative orbit (track) numbers for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackConstants {
    pub offset: i64,
    pub cycle_length: i64,
}

impl TrackConstants {
    pub fn for_platform(platform: &str) -> Option<Self> {
        match platform {
            "Sentinel-1A" => Some(Self {
                offset: 73,
                cycle_length: 175,
            }),
            "Sentinel-1B" => Some(Self {
                offset: 27,
                cycle_length: 175,
            }),
            _ => None,
        }
    }

    pub fn expected_track(&self, orbit_number: i64) -> i64 {
        (orbit_number - self.offset).rem_euclid(self.cycle_length) + 1
    }
}

/// Canonical normalized acquisition, serialized as the dataset `met.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    pub id: String,
    pub title: String,
    pub data_product_name: String,
    pub archive_filename: String,
    #[serde(rename = "sensingStart")]
    pub sensing_start: String,
    #[serde(rename = "sensingStop")]
    pub sensing_stop: String,
    pub track_number: i64,
    #[serde(rename = "orbitNumber")]
    pub orbit_number: i64,
    pub platform: String,
    pub direction: Option<Direction>,
    pub location: JsonValue,
    pub bbox: Vec<[f64; 2]>,
    pub footprint: String,
    #[serde(rename = "missiondatatakeid", default, skip_serializing_if = "Option::is_none")]
    pub mission_data_take_id: Option<String>,
    #[serde(rename = "ingestiondate", default, skip_serializing_if = "Option::is_none")]
    pub ingestion_date: Option<DateTime<Utc>>,
    pub source: SourceKind,
    pub query_api: String,
    pub processing_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Source fields with no canonical slot, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl AcquisitionRecord {
    /// Directory/dataset identifier, e.g. `acquisition-S1A_IW_SLC__..._A69D-esa_scihub`.
    pub fn dataset_id(&self) -> String {
        format!("acquisition-{}-{}", self.title, self.source)
    }

    pub fn sensing_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = DateTime::parse_from_rfc3339(&self.sensing_start).ok()?;
        let stop = DateTime::parse_from_rfc3339(&self.sensing_stop).ok()?;
        Some((start.with_timezone(&Utc), stop.with_timezone(&Utc)))
    }
}

/// The `dataset.json` sidecar written next to a record's `met.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub version: String,
    pub label: String,
    pub location: JsonValue,
    pub starttime: String,
    pub endtime: String,
}

impl DatasetDescriptor {
    pub fn for_record(record: &AcquisitionRecord, version: &str) -> Self {
        Self {
            version: version.to_string(),
            label: record.id.clone(),
            location: record.location.clone(),
            starttime: record.sensing_start.clone(),
            endtime: record.sensing_stop.clone(),
        }
    }
}

/// One document as returned by the catalog, reduced to the fields reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogHit {
    pub doc_id: String,
    pub index: String,
    pub id: Option<String>,
    pub title: Option<String>,
    pub mission_data_take_id: Option<String>,
    pub ingestion_date: Option<DateTime<Utc>>,
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub doc_id: String,
    pub index: String,
    pub ingestion_date: Option<DateTime<Utc>>,
}

/// Read-only snapshot of the catalog, built once before any reconciliation decision.
#[derive(Debug, Clone, Default)]
pub struct ExistingCatalogIndex {
    ids: BTreeSet<String>,
    titles: BTreeSet<String>,
    by_data_take: BTreeMap<String, CatalogEntry>,
}

impl ExistingCatalogIndex {
    pub fn from_hits(hits: impl IntoIterator<Item = CatalogHit>) -> Self {
        let mut index = Self::default();
        for hit in hits {
            let id = hit.id.clone().unwrap_or_else(|| hit.doc_id.clone());
            index.ids.insert(id.clone());
            if let Some(title) = hit.title {
                index.titles.insert(title);
            }
            if hit.deprecated {
                continue;
            }
            let Some(data_take) = hit.mission_data_take_id else {
                continue;
            };
            let entry = CatalogEntry {
                id,
                doc_id: hit.doc_id,
                index: hit.index,
                ingestion_date: hit.ingestion_date,
            };
            let newer = index
                .by_data_take
                .get(&data_take)
                .map_or(true, |existing| existing.ingestion_date < entry.ingestion_date);
            if newer {
                index.by_data_take.insert(data_take, entry);
            }
        }
        index
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn contains_title(&self, title: &str) -> bool {
        self.titles.contains(title)
    }

    pub fn entry_for_data_take(&self, mission_data_take_id: &str) -> Option<&CatalogEntry> {
        self.by_data_take.get(mission_data_take_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationVerdict {
    New,
    AlreadyPresent,
    /// Applied to an existing catalog entry replaced by a strictly newer scrape.
    SupersededByNewer,
    /// A scraped duplicate that is not newer than the catalogued copy.
    Deprecated,
}

impl ReconciliationVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationVerdict::New => "new",
            ReconciliationVerdict::AlreadyPresent => "already_present",
            ReconciliationVerdict::SupersededByNewer => "superseded_by_newer",
            ReconciliationVerdict::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for ReconciliationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
