//! SciHub (OpenSearch) adapter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use s1acq_core::{AcquisitionRecord, Direction, SourceKind};
use s1acq_storage::{HttpRequest, Transport};
use serde_json::{Map, Value as JsonValue};

use crate::normalize::{
    get_accurate_times, json_i64, json_string, parse_catalog_utc, parse_footprint,
    platform_from_title, verify_track, NormalizationError,
};
use crate::{
    format_bound, AdapterError, AdapterSettings, Paging, RawSourceRecord, ScrapeQuery,
    SourceAdapter, SourcePage, RESERVED_FIELDS,
};

pub const DEFAULT_SEARCH_URL: &str = "https://scihub.copernicus.eu/apihub/search";
pub const DEFAULT_PAGE_SIZE: usize = 100;

pub struct ScihubAdapter {
    settings: AdapterSettings,
}

impl ScihubAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    pub fn query_string(query: &ScrapeQuery) -> String {
        let mut q = format!(
            "IW AND producttype:SLC AND platformname:Sentinel-1 AND {}:[{} TO {}]",
            query.purpose.time_field(),
            format_bound(&query.start),
            format_bound(&query.end)
        );
        if let Some(wkt) = &query.polygon_wkt {
            q.push_str(&format!(" ( footprint:\"Intersects({wkt})\")"));
        }
        q
    }
}

#[async_trait]
impl SourceAdapter for ScihubAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Scihub
    }

    fn paging(&self) -> Paging {
        Paging::Offset {
            page_size: self.settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    async fn fetch_page(
        &self,
        transport: &dyn Transport,
        query: &ScrapeQuery,
        offset: usize,
    ) -> Result<SourcePage, AdapterError> {
        let rows = match self.paging() {
            Paging::Offset { page_size } => page_size,
            Paging::Single => DEFAULT_PAGE_SIZE,
        };
        let request = HttpRequest::get(&self.settings.search_url)
            .query("q", Self::query_string(query))
            .query("rows", rows.to_string())
            .query("format", "json")
            .query("start", offset.to_string())
            .basic_auth(self.settings.credentials.clone())
            .retry_transient();
        let body = transport.send_json(request).await?;
        parse_feed(&body)
    }
}

/// `feed.entry` may be a list, a single object, or absent.
pub fn parse_feed(body: &JsonValue) -> Result<SourcePage, AdapterError> {
    let feed = body.get("feed").ok_or_else(|| AdapterError::Shape {
        kind: SourceKind::Scihub,
        message: "response has no `feed`".to_string(),
    })?;
    let reported_total = feed.get("opensearch:totalResults").and_then(|v| {
        json_i64(v).and_then(|n| u64::try_from(n).ok())
    });
    let records = match feed.get("entry") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(entries)) => entries.clone(),
        Some(entry @ JsonValue::Object(_)) => vec![entry.clone()],
        Some(other) => {
            return Err(AdapterError::Shape {
                kind: SourceKind::Scihub,
                message: format!("unexpected `entry` value: {other}"),
            })
        }
    };
    Ok(SourcePage {
        reported_total,
        records: records.into_iter().map(RawSourceRecord::Scihub).collect(),
    })
}

fn group_items(entry: &Map<String, JsonValue>, group: &str) -> Vec<(String, JsonValue)> {
    let items = match entry.get(group) {
        Some(JsonValue::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(item @ JsonValue::Object(_)) => vec![item],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let content = item.get("content").cloned().unwrap_or(JsonValue::Null);
            Some((name, content))
        })
        .collect()
}

fn take_string(
    fields: &mut BTreeMap<String, JsonValue>,
    key: &'static str,
) -> Result<String, NormalizationError> {
    fields
        .remove(key)
        .as_ref()
        .and_then(json_string)
        .ok_or(NormalizationError::MissingField(key))
}

fn take_i64(
    fields: &mut BTreeMap<String, JsonValue>,
    key: &'static str,
) -> Result<i64, NormalizationError> {
    let value = fields
        .remove(key)
        .ok_or(NormalizationError::MissingField(key))?;
    json_i64(&value).ok_or_else(|| NormalizationError::InvalidField {
        field: key.to_string(),
        value: value.to_string(),
    })
}

pub fn normalize_entry(raw: &JsonValue) -> Result<AcquisitionRecord, NormalizationError> {
    let entry = raw.as_object().ok_or(NormalizationError::NotAnObject)?;

    let mut fields: BTreeMap<String, JsonValue> = entry
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "int" | "str" | "date" | "link"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (name, content) in group_items(entry, "int") {
        let value = json_i64(&content).ok_or_else(|| NormalizationError::InvalidField {
            field: name.clone(),
            value: content.to_string(),
        })?;
        let key = match name.as_str() {
            "orbitnumber" => "orbitNumber".to_string(),
            "relativeorbitnumber" => "trackNumber".to_string(),
            _ => name,
        };
        fields.insert(key, JsonValue::from(value));
    }

    if let Some(links) = entry.get("link").and_then(JsonValue::as_array) {
        for link in links {
            let Some(href) = link.get("href").cloned() else {
                continue;
            };
            match link.get("rel").and_then(JsonValue::as_str) {
                Some(rel) => fields.insert(rel.to_string(), href),
                None => fields.insert("download_url".to_string(), href),
            };
        }
    }

    let mut direction = None;
    for (name, content) in group_items(entry, "str") {
        match name.as_str() {
            "orbitdirection" => {
                let text = content.as_str().unwrap_or_default();
                direction = Some(
                    Direction::from_catalog(text)
                        .ok_or_else(|| NormalizationError::UnknownDirection(text.to_string()))?,
                );
            }
            "endposition" => {
                fields.insert("sensingStop".to_string(), content);
            }
            _ => {
                fields.insert(name, content);
            }
        }
    }

    for (name, content) in group_items(entry, "date") {
        let stripped = JsonValue::from(content.as_str().unwrap_or_default().replace('Z', ""));
        match name.as_str() {
            "beginposition" => fields.insert("sensingStart".to_string(), stripped),
            "endposition" => fields.insert("sensingStop".to_string(), stripped),
            _ => fields.insert(name, content),
        };
    }

    let title = take_string(&mut fields, "title")?;
    let id = take_string(&mut fields, "id")?;
    let catalog_start = take_string(&mut fields, "sensingStart")?;
    let catalog_stop = take_string(&mut fields, "sensingStop")?;
    let (sensing_start, sensing_stop) = get_accurate_times(&title, &catalog_start, &catalog_stop)?;

    let track_number = take_i64(&mut fields, "trackNumber")?;
    let orbit_number = take_i64(&mut fields, "orbitNumber")?;
    let footprint = take_string(&mut fields, "footprint")?;
    let geometry = parse_footprint(&footprint)?;

    let platform = platform_from_title(&title)?;
    verify_track(&platform, orbit_number, track_number);

    let mission_data_take_id = fields.remove("missiondatatakeid").as_ref().and_then(json_string);
    let ingestion_date = match fields.remove("ingestiondate") {
        Some(value) => {
            let text = json_string(&value).unwrap_or_default();
            Some(parse_catalog_utc(&text).ok_or(NormalizationError::Timestamp {
                field: "ingestiondate",
                value: text,
            })?)
        }
        None => None,
    };
    let download_url = fields.remove("download_url").as_ref().and_then(json_string);
    let icon = fields.remove("icon").as_ref().and_then(json_string);

    for key in RESERVED_FIELDS {
        fields.remove(*key);
    }

    Ok(AcquisitionRecord {
        data_product_name: format!("acquisition-{title}"),
        archive_filename: format!("{title}.zip"),
        id,
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
        mission_data_take_id,
        ingestion_date,
        source: SourceKind::Scihub,
        query_api: SourceKind::Scihub.query_api().to_string(),
        processing_version: None,
        download_url,
        icon,
        extra: fields,
    })
}
