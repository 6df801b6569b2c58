//! ASF search API adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use s1acq_core::{AcquisitionRecord, Direction, SourceKind};
use s1acq_storage::{HttpRequest, Transport};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::normalize::{
    data_take_from_title, get_accurate_times, json_i64, json_string, orient_polygon_location,
    parse_catalog_utc, parse_footprint, platform_from_title, verify_track, NormalizationError,
};
use crate::{
    format_bound, AdapterError, AdapterSettings, Paging, RawSourceRecord, ScrapeQuery,
    SourceAdapter, SourcePage, RESERVED_FIELDS,
};

pub const DEFAULT_SEARCH_URL: &str = "https://api.daac.asf.alaska.edu/services/search/param";

pub struct AsfAdapter {
    settings: AdapterSettings,
}

impl AsfAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

/// Third `_`-separated token of a granule name is the product type.
pub fn is_raw_product(granule_name: &str) -> bool {
    granule_name.split('_').nth(2) == Some("RAW")
}

#[async_trait]
impl SourceAdapter for AsfAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Asf
    }

    fn paging(&self) -> Paging {
        Paging::Single
    }

    async fn fetch_page(
        &self,
        transport: &dyn Transport,
        query: &ScrapeQuery,
        _offset: usize,
    ) -> Result<SourcePage, AdapterError> {
        let mut request = HttpRequest::get(&self.settings.search_url)
            .query("platform", "SA,SB")
            .query("processingLevel", "METADATA_SLC")
            .query("start", format_bound(&query.start))
            .query("end", format_bound(&query.end))
            .query("output", "json");
        if let Some(wkt) = &query.polygon_wkt {
            request = request.query("intersectsWith", wkt.clone());
        }
        let body = transport.send_json(request.retry_transient()).await?;
        parse_results(&body)
    }
}

/// The response is an array whose first element holds the records.
pub fn parse_results(body: &JsonValue) -> Result<SourcePage, AdapterError> {
    let records = match body.get(0) {
        Some(JsonValue::Array(records)) => records.clone(),
        None if body.as_array().is_some() => Vec::new(),
        _ => {
            return Err(AdapterError::Shape {
                kind: SourceKind::Asf,
                message: "expected an array of result lists".to_string(),
            })
        }
    };
    let total = records.len();
    let records: Vec<RawSourceRecord> = records
        .into_iter()
        .filter(|record| {
            let name = record
                .get("granuleName")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            if is_raw_product(name) {
                debug!(granule = name, "skipping RAW product");
                return false;
            }
            true
        })
        .map(RawSourceRecord::Asf)
        .collect();
    Ok(SourcePage {
        reported_total: Some(total as u64),
        records,
    })
}

fn field<'a>(
    record: &'a serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<&'a JsonValue, NormalizationError> {
    record.get(key).ok_or(NormalizationError::MissingField(key))
}

fn string_field(
    record: &serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<String, NormalizationError> {
    json_string(field(record, key)?).ok_or(NormalizationError::MissingField(key))
}

fn int_field(
    record: &serde_json::Map<String, JsonValue>,
    key: &'static str,
) -> Result<i64, NormalizationError> {
    let value = field(record, key)?;
    json_i64(value).ok_or_else(|| NormalizationError::InvalidField {
        field: key.to_string(),
        value: value.to_string(),
    })
}

pub fn normalize_granule(raw: &JsonValue) -> Result<AcquisitionRecord, NormalizationError> {
    let record = raw.as_object().ok_or(NormalizationError::NotAnObject)?;

    let title = string_field(record, "granuleName")?;
    let start = string_field(record, "startTime")?;
    let stop = string_field(record, "stopTime")?;
    let (sensing_start, sensing_stop) = get_accurate_times(&title, &start, &stop)?;

    let orbit_number = int_field(record, "absoluteOrbit")?;
    let track_number = int_field(record, "relativeOrbit").or_else(|_| int_field(record, "track"))?;
    let platform = platform_from_title(&title)?;
    verify_track(&platform, orbit_number, track_number);

    let footprint = string_field(record, "stringFootprint")?;
    let mut geometry = parse_footprint(&footprint)?;
    orient_polygon_location(&mut geometry.location);

    let direction = record
        .get("flightDirection")
        .and_then(JsonValue::as_str)
        .and_then(Direction::from_catalog);

    let ingestion_date = record
        .get("processingDate")
        .and_then(JsonValue::as_str)
        .and_then(parse_catalog_utc);

    let mut extra: BTreeMap<String, JsonValue> = record
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for key in [
        "granuleName",
        "startTime",
        "stopTime",
        "absoluteOrbit",
        "relativeOrbit",
        "flightDirection",
        "stringFootprint",
        "downloadUrl",
        "browse",
    ] {
        extra.remove(key);
    }
    extra.insert("filename".into(), JsonValue::from(format!("{title}.SAFE")));
    extra.insert("format".into(), JsonValue::from("SAFE"));
    extra.insert("status".into(), JsonValue::from("ARCHIVED"));
    if let Some(scene) = record.get("sceneId") {
        extra.insert("identifier".into(), scene.clone());
    }
    if let Some(polarization) = record.get("polarization").and_then(JsonValue::as_str) {
        extra.insert(
            "polarisationmode".into(),
            JsonValue::from(polarization.replace('+', " ")),
        );
    }
    if let Some(mode) = record.get("beamMode") {
        extra.insert("sensoroperationalmode".into(), mode.clone());
    }
    if let Some(processed) = record.get("processingDate") {
        extra.insert("asf_ingestion_time".into(), processed.clone());
    }
    for key in RESERVED_FIELDS {
        extra.remove(*key);
    }

    Ok(AcquisitionRecord {
        id: title.clone(),
        data_product_name: format!("acquisition-{title}"),
        archive_filename: format!("{title}.zip"),
        mission_data_take_id: data_take_from_title(&title),
        title,
        sensing_start,
        sensing_stop,
        track_number,
        orbit_number,
        platform,
        direction,
        location: geometry.location,
        bbox: geometry.bbox,
        footprint,
        ingestion_date,
        source: SourceKind::Asf,
        query_api: SourceKind::Asf.query_api().to_string(),
        processing_version: None,
        download_url: record.get("downloadUrl").and_then(json_string),
        icon: record.get("browse").and_then(json_string),
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn granule() -> JsonValue {
        json!({
            "granuleName": "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D",
            "sceneId": "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D",
            "startTime": "2015-09-09T16:37:11.561000",
            "stopTime": "2015-09-09T16:37:46.345000",
            "absoluteOrbit": "7640",
            "relativeOrbit": "43",
            "flightDirection": "ASCENDING",
            "stringFootprint": "POLYGON((-118.4 34.2,-115.7 34.6,-115.4 33.0,-118.1 32.6,-118.4 34.2))",
            "downloadUrl": "https://datapool.test/SLC/SA/S1A.zip",
            "browse": "https://datapool.test/BROWSE/SA/S1A.jpg",
            "processingDate": "2015-09-09T20:47:23.561000",
            "polarization": "VV+VH",
            "beamMode": "IW"
        })
    }

    #[test]
    fn granule_is_normalized_with_catalog_orientation() {
        let record = normalize_granule(&granule()).unwrap();
        assert_eq!(record.id, record.title);
        assert_eq!(record.source, SourceKind::Asf);
        assert_eq!(record.query_api, "asf_api_search");
        assert_eq!(record.sensing_start, "2015-09-09T16:37:11.561Z");
        assert_eq!(record.track_number, 43);
        assert_eq!(record.mission_data_take_id.as_deref(), Some("43390"));
        assert_eq!(record.location["coordinates"][0][1], json!([-118.1, 32.6]));
        assert_eq!(record.extra.get("polarisationmode"), Some(&json!("VV VH")));
        assert!(record.ingestion_date.is_some());
    }

    #[test]
    fn track_mismatch_keeps_scraped_track() {
        let mut raw = granule();
        raw["relativeOrbit"] = json!("44");
        let record = normalize_granule(&raw).unwrap();
        assert_eq!(record.track_number, 44);
        assert_eq!(record.orbit_number, 7640);
    }

    #[test]
    fn unknown_flight_direction_is_left_empty() {
        let mut raw = granule();
        raw["flightDirection"] = json!("N/A");
        assert_eq!(normalize_granule(&raw).unwrap().direction, None);
    }

    #[test]
    fn track_falls_back_to_track_field() {
        let mut raw = granule();
        raw.as_object_mut().unwrap().remove("relativeOrbit");
        raw["track"] = json!(43);
        assert_eq!(normalize_granule(&raw).unwrap().track_number, 43);
    }

    #[test]
    fn raw_products_are_filtered_from_results() {
        let mut raw = granule();
        raw["granuleName"] =
            json!("S1A_IW_RAW__0SDV_20150909T163707_20150909T163739_007640_00A97E_1B1E");
        let page = parse_results(&json!([[granule(), raw]])).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.reported_total, Some(2));
        assert!(parse_results(&json!([])).unwrap().records.is_empty());
        assert!(parse_results(&json!({"error": "bad"})).is_err());
    }
}
