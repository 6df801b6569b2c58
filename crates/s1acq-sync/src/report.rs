//! Run status table and the optional report dataset.

use std::collections::BTreeMap;

use comfy_table::{presets::ASCII_FULL, ContentArrangement, Table};
use s1acq_core::AcquisitionRecord;
use s1acq_storage::{DatasetStore, WrittenDataset};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

pub const REPORT_VERSION: &str = "v0.1";

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub start: String,
    pub end: String,
    pub catalog: String,
    pub total_on_source: usize,
    pub missing: Vec<String>,
    pub by_track: BTreeMap<i64, Vec<String>>,
}

impl StatusReport {
    pub fn new<'a>(
        start: &str,
        end: &str,
        catalog: &str,
        scraped: impl IntoIterator<Item = &'a AcquisitionRecord>,
        missing: impl IntoIterator<Item = &'a AcquisitionRecord>,
    ) -> Self {
        let mut total_on_source = 0;
        let mut by_track: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for record in scraped {
            total_on_source += 1;
            by_track.entry(record.track_number).or_default().push(record.id.clone());
        }
        let mut missing: Vec<String> = missing.into_iter().map(|r| r.id.clone()).collect();
        missing.sort();
        Self {
            start: start.to_string(),
            end: end.to_string(),
            catalog: catalog.to_string(),
            total_on_source,
            missing,
            by_track,
        }
    }

    pub fn render(&self) -> String {
        let mut availability = grid_table(&["source", "count"]);
        availability
            .add_row(vec!["total on source".to_string(), self.total_on_source.to_string()])
            .add_row(vec!["missing products".to_string(), self.missing.len().to_string()]);

        let mut tracks = grid_table(&["track", "products"]);
        for (track, ids) in &self.by_track {
            tracks.add_row(vec![track.to_string(), ids.len().to_string()]);
        }

        let mut missing = grid_table(&["status", "id"]);
        for id in &self.missing {
            missing.add_row(vec!["missing", id.as_str()]);
        }

        format!(
            "Global data availability for {} through {}:\n{availability}\n\n\
             Product count by track:\n{tracks}\n\n\
             Missing products:\n{missing}\n\
             Missing {} in {} out of {} on source\n",
            self.start,
            self.end,
            self.missing.len(),
            self.catalog,
            self.total_on_source
        )
    }

    pub fn log(&self) {
        info!("{}", self.render());
    }
}

fn grid_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Disabled)
        .set_header(header.to_vec());
    table
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDataset {
    pub version: String,
    pub label: String,
    pub location: JsonValue,
    pub starttime: String,
    pub endtime: String,
}

pub fn report_label(aoi_name: Option<&str>, start: &str, end: &str) -> String {
    match aoi_name {
        Some(aoi) => format!("report-{aoi}_{start}_{end}"),
        None => format!("report-daily_{start}_{end}"),
    }
}

pub async fn write_report_dataset(
    store: &DatasetStore,
    start: &str,
    end: &str,
    polygon: Option<&JsonValue>,
    still_missing: &[String],
    aoi_name: Option<&str>,
) -> anyhow::Result<WrittenDataset> {
    let label = report_label(aoi_name, start, end);
    let dataset = ReportDataset {
        version: REPORT_VERSION.to_string(),
        label: label.clone(),
        location: polygon.cloned().unwrap_or(JsonValue::Null),
        starttime: start.to_string(),
        endtime: end.to_string(),
    };
    let met = json!({
        "missing_count": still_missing.len(),
        "missing acquisitions": still_missing,
    });
    let written = store.write_dataset(&label, &dataset, &met).await?;
    info!(label = %label, missing = still_missing.len(), "wrote report dataset");
    Ok(written)
}
