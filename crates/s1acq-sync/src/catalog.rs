//! Elasticsearch-backed acquisition catalog: scroll reads, existing-ID index, deprecation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s1acq_adapters::format_bound;
use s1acq_adapters::normalize::parse_catalog_utc;
use s1acq_core::{CatalogEntry, CatalogHit, ExistingCatalogIndex};
use s1acq_storage::{FetchError, HttpRequest, Transport};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::reconcile::Deprecator;

pub const DOC_TYPE: &str = "acquisition-S1-IW_SLC";
const SCROLL_KEEPALIVE: &str = "60m";
const SCROLL_SIZE: &str = "10000";

pub fn acquisition_index(dataset_version: &str) -> String {
    format!("grq_{dataset_version}_acquisition-s1-iw_slc")
}

/// Catalog document with its raw metadata, as handed to IPF scraper jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogAcquisition {
    pub doc_id: String,
    pub index: String,
    pub metadata: JsonValue,
}

impl CatalogAcquisition {
    pub fn sensing_start(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("sensingStart")
            .and_then(JsonValue::as_str)
            .and_then(parse_catalog_utc)
    }
}

pub struct CatalogClient {
    base_url: String,
    index: String,
    transport: Arc<dyn Transport>,
}

impl CatalogClient {
    pub fn new(base_url: &str, index: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.into(),
            transport,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Every hit for `query`, following the scroll cursor until a page comes back empty.
    pub async fn scroll(&self, query: &JsonValue) -> Result<Vec<JsonValue>, FetchError> {
        let url = format!("{}/{}/_search", self.base_url, self.index);
        let first = self
            .transport
            .send_json(
                HttpRequest::post(url)
                    .query("scroll", SCROLL_KEEPALIVE)
                    .query("size", SCROLL_SIZE)
                    .body(query.to_string()),
            )
            .await?;

        if total_hits(&first) == Some(0) {
            return Ok(Vec::new());
        }
        let Some(mut scroll_id) = scroll_id_of(&first) else {
            warn!(
                index = %self.index,
                %query,
                "no _scroll_id in search response; treating as empty"
            );
            return Ok(Vec::new());
        };

        let mut hits = hits_of(&first);
        let scroll_url = format!("{}/_search/scroll", self.base_url);
        loop {
            let page = self
                .transport
                .send_json(
                    HttpRequest::post(&scroll_url)
                        .query("scroll", SCROLL_KEEPALIVE)
                        .body(scroll_id.clone()),
                )
                .await?;
            let page_hits = hits_of(&page);
            if page_hits.is_empty() {
                break;
            }
            hits.extend(page_hits);
            if let Some(next) = scroll_id_of(&page) {
                scroll_id = next;
            }
        }
        Ok(hits)
    }

    /// Snapshot of catalog entries whose `[starttime, endtime]` overlaps `[start, end)`.
    pub async fn existing_index(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        polygon: Option<&JsonValue>,
    ) -> Result<ExistingCatalogIndex, FetchError> {
        let hits = self.scroll(&overlap_query(start, end, polygon)).await?;
        let index =
            ExistingCatalogIndex::from_hits(hits.iter().map(|hit| catalog_hit(hit, &self.index)));
        info!(
            index = %self.index,
            hits = hits.len(),
            known = index.len(),
            "loaded existing acquisitions"
        );
        Ok(index)
    }

    /// Acquisitions sensed within the window that have no `processing_version` yet.
    pub async fn non_ipf_acquisitions(
        &self,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
        polygon: Option<&JsonValue>,
    ) -> Result<Vec<CatalogAcquisition>, FetchError> {
        let hits = self.scroll(&sensing_query(start, end, polygon)).await?;
        Ok(hits
            .iter()
            .filter_map(|hit| {
                let metadata = hit.pointer("/_source/metadata")?.clone();
                if !metadata
                    .get("processing_version")
                    .map_or(true, JsonValue::is_null)
                {
                    return None;
                }
                Some(CatalogAcquisition {
                    doc_id: hit.get("_id")?.as_str()?.to_string(),
                    index: hit
                        .get("_index")
                        .and_then(JsonValue::as_str)
                        .unwrap_or(&self.index)
                        .to_string(),
                    metadata,
                })
            })
            .collect())
    }

    pub async fn deprecate_document(&self, index: &str, doc_id: &str) -> Result<(), FetchError> {
        let url = format!("{}/{}/{}/{}/_update", self.base_url, index, DOC_TYPE, doc_id);
        let body = json!({"doc": {"metadata": {"tags": "deprecated"}}});
        self.transport
            .send_json(HttpRequest::post(url).body(body.to_string()))
            .await?;
        info!(index, doc_id, "tagged catalog document as deprecated");
        Ok(())
    }

    /// `metadata.processing_version` of a catalog document, if it has one.
    pub async fn processing_version(
        &self,
        index: &str,
        doc_id: &str,
    ) -> Result<Option<String>, FetchError> {
        let url = format!("{}/{}/_search", self.base_url, index);
        let body = json!({"query": {"term": {"_id": doc_id}}});
        let response = self
            .transport
            .send_json(HttpRequest::post(url).body(body.to_string()))
            .await?;
        Ok(response
            .pointer("/hits/hits/0/_source/metadata/processing_version")
            .and_then(JsonValue::as_str)
            .map(str::to_string))
    }

    pub async fn set_processing_version(
        &self,
        index: &str,
        doc_id: &str,
        version: &str,
    ) -> Result<(), FetchError> {
        let url = format!("{}/{}/{}/{}/_update", self.base_url, index, DOC_TYPE, doc_id);
        let body = json!({"doc": {"metadata": {"processing_version": version}}});
        self.transport
            .send_json(HttpRequest::post(url).body(body.to_string()))
            .await?;
        info!(index, doc_id, version, "recorded processing version");
        Ok(())
    }
}

#[async_trait]
impl Deprecator for CatalogClient {
    async fn deprecate(&self, entry: &CatalogEntry) -> Result<(), FetchError> {
        self.deprecate_document(&entry.index, &entry.doc_id).await
    }
}

fn geo_filter(polygon: Option<&JsonValue>) -> Vec<JsonValue> {
    polygon
        .map(|shape| json!({"geo_shape": {"location": {"shape": shape}}}))
        .into_iter()
        .collect()
}

pub fn overlap_query(
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    polygon: Option<&JsonValue>,
) -> JsonValue {
    json!({
        "query": {
            "bool": {
                "must": [
                    {"range": {"endtime": {"gte": format_bound(start)}}},
                    {"range": {"starttime": {"lt": format_bound(end)}}}
                ],
                "filter": geo_filter(polygon)
            }
        }
    })
}

pub fn sensing_query(
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    polygon: Option<&JsonValue>,
) -> JsonValue {
    json!({
        "query": {
            "bool": {
                "must": [
                    {"range": {"metadata.sensingStart": {
                        "gte": format_bound(start),
                        "lte": format_bound(end)
                    }}}
                ],
                "filter": geo_filter(polygon)
            }
        }
    })
}

fn total_hits(body: &JsonValue) -> Option<u64> {
    match body.pointer("/hits/total")? {
        JsonValue::Object(total) => total.get("value").and_then(JsonValue::as_u64),
        other => other.as_u64(),
    }
}

fn scroll_id_of(body: &JsonValue) -> Option<String> {
    body.get("_scroll_id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

fn hits_of(body: &JsonValue) -> Vec<JsonValue> {
    body.pointer("/hits/hits")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn is_deprecated(metadata: &JsonValue) -> bool {
    match metadata.get("tags") {
        Some(JsonValue::String(tag)) => tag == "deprecated",
        Some(JsonValue::Array(tags)) => tags.iter().any(|t| t.as_str() == Some("deprecated")),
        _ => false,
    }
}

pub fn catalog_hit(hit: &JsonValue, default_index: &str) -> CatalogHit {
    let metadata = hit.pointer("/_source/metadata").cloned().unwrap_or(JsonValue::Null);
    let text = |key: &str| match metadata.get(key) {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    CatalogHit {
        doc_id: hit
            .get("_id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string(),
        index: hit
            .get("_index")
            .and_then(JsonValue::as_str)
            .unwrap_or(default_index)
            .to_string(),
        id: text("id"),
        title: text("title"),
        mission_data_take_id: text("missiondatatakeid"),
        ingestion_date: text("ingestiondate").as_deref().and_then(parse_catalog_utc),
        deprecated: is_deprecated(&metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s1acq_storage::{MemoryTransport, Method};

    const ES: &str = "http://grq.test:9200";

    fn hit(doc_id: &str, id: &str, take: &str, ingested: &str) -> JsonValue {
        json!({
            "_index": "grq_v2.0_acquisition-s1-iw_slc",
            "_id": doc_id,
            "_source": {"metadata": {
                "id": id,
                "title": format!("title-{id}"),
                "missiondatatakeid": take,
                "ingestiondate": ingested
            }}
        })
    }

    fn client(transport: &Arc<MemoryTransport>) -> CatalogClient {
        CatalogClient::new(&format!("{ES}/"), acquisition_index("v2.0"), transport.clone())
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = "2015-09-09T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        (start, start + chrono::Duration::days(1))
    }

    #[tokio::test]
    async fn scroll_collects_first_response_and_pages_until_empty() {
        let transport = Arc::new(MemoryTransport::new());
        let search = format!("{ES}/grq_v2.0_acquisition-s1-iw_slc/_search");
        let scroll = format!("{ES}/_search/scroll");
        transport.respond_json(
            Method::Post,
            &search,
            &json!({"_scroll_id": "c1", "hits": {"total": 3, "hits": [
                hit("d1", "a", "1", "2015-09-09T10:00:00Z")
            ]}}),
        );
        transport.respond_json(
            Method::Post,
            &scroll,
            &json!({"_scroll_id": "c2", "hits": {"hits": [
                hit("d2", "b", "2", "2015-09-09T10:00:00Z"),
                hit("d3", "c", "3", "2015-09-09T10:00:00Z")
            ]}}),
        );
        transport.respond_json(
            Method::Post,
            &scroll,
            &json!({"_scroll_id": "c3", "hits": {"hits": []}}),
        );

        let (start, end) = window();
        let index = client(&transport).existing_index(&start, &end, None).await.unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.contains_id("c"));
        assert!(index.contains_title("title-b"));
        let scrolls = transport.requests_to(Method::Post, &scroll);
        assert_eq!(scrolls.len(), 2);
        assert_eq!(scrolls[0].body.as_deref(), Some("c1"));
        assert_eq!(scrolls[1].body.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn zero_hits_and_missing_cursor_are_empty() {
        let (start, end) = window();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_json(
            Method::Post,
            ES,
            &json!({"hits": {"total": {"value": 0}, "hits": []}}),
        );
        assert!(client(&transport).existing_index(&start, &end, None).await.unwrap().is_empty());

        let transport = Arc::new(MemoryTransport::new());
        transport.respond_json(Method::Post, ES, &json!({"hits": {"total": 5, "hits": []}}));
        assert!(client(&transport).existing_index(&start, &end, None).await.unwrap().is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn search_failure_propagates() {
        let (start, end) = window();
        let transport = Arc::new(MemoryTransport::new());
        transport.respond(Method::Post, ES, 500, "shard failure");
        let err = client(&transport).existing_index(&start, &end, None).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn deprecation_posts_partial_update_to_document_index() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_json(Method::Post, ES, &json!({"result": "updated"}));
        client(&transport)
            .deprecate_document("grq_v2.0_acquisition-s1-iw_slc", "doc-9")
            .await
            .unwrap();

        let request = &transport.requests()[0];
        assert_eq!(
            request.url,
            format!("{ES}/grq_v2.0_acquisition-s1-iw_slc/acquisition-S1-IW_SLC/doc-9/_update")
        );
        let body: JsonValue = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"doc": {"metadata": {"tags": "deprecated"}}}));
    }

    #[tokio::test]
    async fn processing_version_is_read_and_written_under_metadata() {
        let transport = Arc::new(MemoryTransport::new());
        let index = "grq_v2.0_acquisition-s1-iw_slc";
        let mut processed = hit("d2", "b", "2", "2015-09-09T10:00:00Z");
        processed["_source"]["metadata"]["processing_version"] = json!("002.71");
        transport.respond_json(
            Method::Post,
            &format!("{ES}/{index}/_search"),
            &json!({"hits": {"total": 1, "hits": [processed]}}),
        );
        transport.respond_json(
            Method::Post,
            &format!("{ES}/{index}/{DOC_TYPE}/"),
            &json!({"result": "updated"}),
        );

        let catalog = client(&transport);
        assert_eq!(
            catalog.processing_version(index, "d2").await.unwrap().as_deref(),
            Some("002.71")
        );
        catalog.set_processing_version(index, "d1", "003.10").await.unwrap();

        let lookup: JsonValue =
            serde_json::from_str(transport.requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(lookup, json!({"query": {"term": {"_id": "d2"}}}));
        let update = &transport.requests()[1];
        assert_eq!(update.url, format!("{ES}/{index}/{DOC_TYPE}/d1/_update"));
        let body: JsonValue = serde_json::from_str(update.body.as_deref().unwrap()).unwrap();
        assert_eq!(body, json!({"doc": {"metadata": {"processing_version": "003.10"}}}));
    }

    #[tokio::test]
    async fn non_ipf_acquisitions_skip_processed_documents() {
        let transport = Arc::new(MemoryTransport::new());
        let mut processed = hit("d2", "b", "2", "2015-09-09T10:00:00Z");
        processed["_source"]["metadata"]["processing_version"] = json!("002.71");
        transport.respond_json(
            Method::Post,
            &format!("{ES}/grq_v2.0_acquisition-s1-iw_slc/_search"),
            &json!({"_scroll_id": "c1", "hits": {"total": 2, "hits": [
                hit("d1", "a", "1", "2015-09-09T10:00:00Z"),
                processed
            ]}}),
        );
        transport.respond_json(
            Method::Post,
            &format!("{ES}/_search/scroll"),
            &json!({"hits": {"hits": []}}),
        );

        let (start, end) = window();
        let polygon = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        });
        let acqs = client(&transport)
            .non_ipf_acquisitions(&start, &end, Some(&polygon))
            .await
            .unwrap();

        assert_eq!(acqs.len(), 1);
        assert_eq!(acqs[0].doc_id, "d1");
        let query: JsonValue =
            serde_json::from_str(transport.requests()[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(query["query"]["bool"]["filter"][0]["geo_shape"]["location"]["shape"], polygon);
    }

    #[test]
    fn tagged_hits_are_marked_deprecated() {
        let mut tagged = hit("d1", "a", "1", "2015-09-09T10:00:00Z");
        tagged["_source"]["metadata"]["tags"] = json!(["deprecated"]);
        assert!(catalog_hit(&tagged, "idx").deprecated);
        assert!(!catalog_hit(&hit("d2", "b", "2", "bad"), "idx").deprecated);
        assert_eq!(catalog_hit(&hit("d2", "b", "2", "bad"), "idx").ingestion_date, None);
    }
}
