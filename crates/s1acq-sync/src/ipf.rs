//! Processing-version (IPF) lookup for catalogued acquisitions.
//!
//! SciHub products carry the version in `manifest.safe`; older products are
//! looked up through the ASF ISO metadata granule instead.

use std::sync::Arc;

use roxmltree::{Document, Node};
use s1acq_storage::{FetchError, HttpRequest, HttpResponse, Transport};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::catalog::CatalogClient;
use crate::submit::IpfEndpoint;

const MANIFEST: &str = "manifest.safe";
const ISO_LINEAGE: [&str; 5] = [
    "description",
    "LI_ProcessStep",
    "processStep",
    "LI_Lineage",
    "lineage",
];

#[derive(Debug, Error)]
pub enum IpfError {
    #[error("acquisition {0} already has a processing version")]
    AlreadyKnown(String),
    #[error("acquisition metadata has no `{0}`")]
    MissingField(&'static str),
    #[error("product at {url} is not available: {reason}")]
    Unavailable { url: String, reason: String },
    #[error("acquisition {0} not found at ASF")]
    NotAtAsf(String),
    #[error("no processing version in {0}")]
    NotFound(String),
    #[error("invalid xml from {url}: {message}")]
    Xml { url: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One IPF scrape: the catalog document and where to look its version up.
#[derive(Debug, Clone, PartialEq)]
pub struct IpfRequest {
    pub acq_id: String,
    pub acq_met: JsonValue,
    pub index: String,
    pub endpoint: IpfEndpoint,
}

fn met_str<'a>(met: &'a JsonValue, key: &'static str) -> Result<&'a str, IpfError> {
    met.get(key)
        .and_then(JsonValue::as_str)
        .ok_or(IpfError::MissingField(key))
}

/// Manifest URLs to try in order: the `/dhus/` mirror first, then the original.
pub fn manifest_urls(met: &JsonValue) -> Result<Vec<String>, IpfError> {
    let alternative = met_str(met, "alternative")?.trim_end_matches('/');
    let filename = match met_str(met, "filename") {
        Ok(filename) => filename.to_string(),
        Err(_) => {
            let title = met_str(met, "title").map_err(|_| IpfError::MissingField("filename"))?;
            format!("{title}.SAFE")
        }
    };
    let apihub = format!("{alternative}/Nodes('{filename}')/Nodes('{MANIFEST}')/$value");
    let dhus = apihub.replace("/apihub/", "/dhus/");
    if dhus == apihub {
        Ok(vec![apihub])
    } else {
        Ok(vec![dhus, apihub])
    }
}

fn parse_xml<'input>(xml: &'input str, url: &str) -> Result<Document<'input>, IpfError> {
    Document::parse(xml).map_err(|e| IpfError::Xml {
        url: url.to_string(),
        message: e.to_string(),
    })
}

fn is_element(node: &Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

/// True when the parent chain of `node` matches `names`, nearest first.
fn under(node: &Node, names: &[&str]) -> bool {
    let mut current = *node;
    for name in names {
        match current.parent_element() {
            Some(parent) if parent.tag_name().name() == *name => current = parent,
            _ => return false,
        }
    }
    true
}

/// `safe:processing/safe:facility/safe:software/@version` from a SAFE manifest.
pub fn manifest_ipf(xml: &str, url: &str) -> Result<String, IpfError> {
    let doc = parse_xml(xml, url)?;
    doc.descendants()
        .find(|n| is_element(n, "software") && under(n, &["facility", "processing"]))
        .and_then(|n| n.attribute("version"))
        .map(str::to_string)
        .ok_or_else(|| IpfError::NotFound(url.to_string()))
}

/// Version from the lineage process-step description of an ASF ISO granule,
/// e.g. `Sentinel-1 IPF (version 002.71)`.
pub fn iso_ipf(xml: &str, url: &str) -> Result<String, IpfError> {
    let doc = parse_xml(xml, url)?;
    doc.descendants()
        .find(|n| is_element(n, "CharacterString") && under(n, &ISO_LINEAGE))
        .and_then(|n| n.text())
        .and_then(|text| text.split("version").nth(1))
        .and_then(|rest| rest.split(')').next())
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string)
        .ok_or_else(|| IpfError::NotFound(url.to_string()))
}

pub struct IpfScraper {
    transport: Arc<dyn Transport>,
    asf_search_url: String,
    credentials: Option<(String, String)>,
}

impl IpfScraper {
    pub fn new(transport: Arc<dyn Transport>, asf_search_url: impl Into<String>) -> Self {
        Self {
            transport,
            asf_search_url: asf_search_url.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<(String, String)>) -> Self {
        self.credentials = credentials;
        self
    }

    async fn scihub_get(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        self.transport
            .execute(request.basic_auth(self.credentials.clone()).retry_transient())
            .await
    }

    pub async fn scihub_ipf(&self, met: &JsonValue) -> Result<String, IpfError> {
        let product = format!("{}/$value", met_str(met, "alternative")?.trim_end_matches('/'));
        let status = self.scihub_get(HttpRequest::head(&product)).await?.status;
        let reason = match status {
            200 => None,
            202 => Some("moved to long term archive".to_string()),
            503 => Some("exceeding max concurrent connections".to_string()),
            other => Some(format!("status {other}")),
        };
        if let Some(reason) = reason {
            return Err(IpfError::Unavailable { url: product, reason });
        }

        let mut failure = None;
        for url in manifest_urls(met)? {
            let response = self.scihub_get(HttpRequest::get(&url)).await?;
            info!(url = %response.final_url, status = response.status, "fetched manifest");
            match response.error_for_status() {
                Ok(response) => return manifest_ipf(&String::from_utf8_lossy(&response.body), &url),
                Err(err) => failure = Some(err),
            }
        }
        Err(failure.map_or(IpfError::MissingField("alternative"), IpfError::from))
    }

    pub async fn asf_ipf(&self, identifier: &str) -> Result<String, IpfError> {
        let results = self
            .transport
            .send_json(
                HttpRequest::get(&self.asf_search_url)
                    .query("platform", "SA,SB")
                    .query("processingLevel", "METADATA_SLC")
                    .query("granule_list", identifier)
                    .query("output", "json")
                    .retry_transient(),
            )
            .await?;
        let download = results
            .pointer("/0/0/downloadUrl")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| IpfError::NotAtAsf(identifier.to_string()))?;
        let response = self
            .transport
            .execute(HttpRequest::get(download).retry_transient())
            .await?
            .error_for_status()?;
        iso_ipf(&String::from_utf8_lossy(&response.body), download)
    }

    pub async fn lookup(&self, endpoint: IpfEndpoint, met: &JsonValue) -> Result<String, IpfError> {
        match endpoint {
            IpfEndpoint::Scihub => self.scihub_ipf(met).await,
            IpfEndpoint::Asf => {
                let identifier = met_str(met, "identifier").or_else(|_| met_str(met, "title"))?;
                self.asf_ipf(identifier).await
            }
        }
    }
}

/// Looks up the processing version of one document and writes it back to the catalog.
pub async fn scrape_ipf(
    catalog: &CatalogClient,
    scraper: &IpfScraper,
    request: &IpfRequest,
) -> Result<String, IpfError> {
    if catalog
        .processing_version(&request.index, &request.acq_id)
        .await?
        .is_some()
    {
        return Err(IpfError::AlreadyKnown(request.acq_id.clone()));
    }
    let version = scraper.lookup(request.endpoint, &request.acq_met).await?;
    catalog
        .set_processing_version(&request.index, &request.acq_id, &version)
        .await?;
    info!(
        acq_id = %request.acq_id,
        endpoint = request.endpoint.as_str(),
        %version,
        "updated processing version"
    );
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DOC_TYPE;
    use s1acq_storage::{MemoryTransport, Method};
    use serde_json::json;

    const ES: &str = "http://grq.test:9200";
    const INDEX: &str = "grq_v2.0_acquisition-s1-iw_slc";
    const PRODUCT: &str = "https://scihub.test/apihub/odata/v1/Products('1fa7')";
    const ASF: &str = "https://asf.test/services/search/param";

    const MANIFEST_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xfdu:XFDU xmlns:xfdu="urn:ccsds:schema:xfdu:1" xmlns:safe="http://www.esa.int/safe/sentinel-1.0">
  <metadataSection>
    <metadataObject ID="processing">
      <metadataWrap>
        <xmlData>
          <safe:processing name="SLC Processing">
            <safe:facility country="Germany" name="Sentinel-1 IPF">
              <safe:software name="Sentinel-1 IPF" version="002.71"/>
            </safe:facility>
          </safe:processing>
        </xmlData>
      </metadataWrap>
    </metadataObject>
  </metadataSection>
</xfdu:XFDU>"#;

    const ISO_XML: &str = r#"<gmi:MI_Metadata xmlns:gmd="http://www.isotc211.org/2005/gmd" xmlns:gmi="http://www.isotc211.org/2005/gmi" xmlns:gco="http://www.isotc211.org/2005/gco">
  <gmd:composedOf><gmd:DS_DataSet><gmd:has><gmi:MI_Metadata>
    <gmd:dataQualityInfo><gmd:DQ_DataQuality><gmd:lineage><gmd:LI_Lineage>
      <gmd:processStep><gmd:LI_ProcessStep><gmd:description>
        <gco:CharacterString>Sentinel-1 IPF (version 003.10)</gco:CharacterString>
      </gmd:description></gmd:LI_ProcessStep></gmd:processStep>
    </gmd:LI_Lineage></gmd:lineage></gmd:DQ_DataQuality></gmd:dataQualityInfo>
  </gmi:MI_Metadata></gmd:has></gmd:DS_DataSet></gmd:composedOf>
</gmi:MI_Metadata>"#;

    fn met() -> JsonValue {
        json!({
            "title": "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D",
            "identifier": "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D",
            "alternative": format!("{PRODUCT}/"),
            "filename": "S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D.SAFE"
        })
    }

    fn request(endpoint: IpfEndpoint) -> IpfRequest {
        IpfRequest {
            acq_id: "acquisition-S1A_X-esa_scihub".into(),
            acq_met: met(),
            index: INDEX.into(),
            endpoint,
        }
    }

    fn fixtures(transport: &Arc<MemoryTransport>) -> (CatalogClient, IpfScraper) {
        transport.respond_json(
            Method::Post,
            &format!("{ES}/{INDEX}/_search"),
            &json!({"hits": {"total": 1, "hits": [
                {"_id": "acquisition-S1A_X-esa_scihub", "_source": {"metadata": {}}}
            ]}}),
        );
        transport.respond_json(
            Method::Post,
            &format!("{ES}/{INDEX}/{DOC_TYPE}/"),
            &json!({"result": "updated"}),
        );
        (
            CatalogClient::new(ES, INDEX, transport.clone()),
            IpfScraper::new(transport.clone(), ASF),
        )
    }

    fn update_body(transport: &MemoryTransport) -> JsonValue {
        let update = transport.requests_to(Method::Post, &format!("{ES}/{INDEX}/{DOC_TYPE}/"));
        serde_json::from_str(update[0].body.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn manifest_urls_try_dhus_before_apihub() {
        let urls = manifest_urls(&met()).unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls[0]
            .starts_with("https://scihub.test/dhus/odata/v1/Products('1fa7')/Nodes('S1A_IW_SLC__"));
        assert!(urls[1].ends_with(".SAFE')/Nodes('manifest.safe')/$value"));
        assert!(urls[1].contains("/apihub/"));

        let mut offline = met();
        offline.as_object_mut().unwrap().remove("alternative");
        assert!(matches!(manifest_urls(&offline), Err(IpfError::MissingField("alternative"))));
    }

    #[test]
    fn versions_are_extracted_from_manifest_and_iso_xml() {
        assert_eq!(manifest_ipf(MANIFEST_XML, "m").unwrap(), "002.71");
        assert_eq!(iso_ipf(ISO_XML, "i").unwrap(), "003.10");
        assert!(matches!(manifest_ipf("<XFDU/>", "m"), Err(IpfError::NotFound(_))));
        assert!(matches!(manifest_ipf("<XFDU", "m"), Err(IpfError::Xml { .. })));
    }

    #[tokio::test]
    async fn scihub_manifest_version_is_written_to_catalog() {
        let transport = Arc::new(MemoryTransport::new());
        let (catalog, scraper) = fixtures(&transport);
        transport.respond(Method::Head, &format!("{PRODUCT}/$value"), 200, "");
        transport.respond(Method::Get, "https://scihub.test/apihub/", 200, MANIFEST_XML);

        let version = scrape_ipf(&catalog, &scraper, &request(IpfEndpoint::Scihub)).await.unwrap();

        assert_eq!(version, "002.71");
        assert_eq!(
            update_body(&transport),
            json!({"doc": {"metadata": {"processing_version": "002.71"}}})
        );
        let gets = transport.requests_to(Method::Get, "https://scihub.test/");
        assert_eq!(gets.len(), 2);
        assert!(gets[0].url.contains("/dhus/"));
    }

    #[tokio::test]
    async fn missing_manifest_fails_without_catalog_update() {
        let transport = Arc::new(MemoryTransport::new());
        let (catalog, scraper) = fixtures(&transport);
        transport.respond(Method::Head, &format!("{PRODUCT}/$value"), 200, "");

        let err = scrape_ipf(&catalog, &scraper, &request(IpfEndpoint::Scihub)).await.unwrap_err();

        assert!(matches!(err, IpfError::Fetch(FetchError::HttpStatus { status: 404, .. })));
        assert!(transport
            .requests_to(Method::Post, &format!("{ES}/{INDEX}/{DOC_TYPE}/"))
            .is_empty());
    }

    #[tokio::test]
    async fn archived_product_is_unavailable() {
        let transport = Arc::new(MemoryTransport::new());
        let (catalog, scraper) = fixtures(&transport);
        transport.respond(Method::Head, &format!("{PRODUCT}/$value"), 202, "");

        let err = scrape_ipf(&catalog, &scraper, &request(IpfEndpoint::Scihub)).await.unwrap_err();
        assert!(matches!(err, IpfError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn asf_iso_version_is_written_to_catalog() {
        let transport = Arc::new(MemoryTransport::new());
        let (catalog, scraper) = fixtures(&transport);
        transport.respond_json(
            Method::Get,
            ASF,
            &json!([[{"downloadUrl": "https://datapool.test/METADATA_SLC/S1A.iso.xml"}]]),
        );
        transport.respond(Method::Get, "https://datapool.test/", 200, ISO_XML);

        let version = scrape_ipf(&catalog, &scraper, &request(IpfEndpoint::Asf)).await.unwrap();

        assert_eq!(version, "003.10");
        let search = &transport.requests_to(Method::Get, ASF)[0];
        assert_eq!(search.query_value("processingLevel"), Some("METADATA_SLC"));
        assert_eq!(
            search.query_value("granule_list"),
            Some("S1A_IW_SLC__1SDV_20150909T163711_20150909T163746_007640_00A97E_A69D")
        );
        assert_eq!(update_body(&transport)["doc"]["metadata"]["processing_version"], "003.10");
    }

    #[tokio::test]
    async fn documents_with_a_version_are_not_scraped_again() {
        let transport = Arc::new(MemoryTransport::new());
        transport.respond_json(
            Method::Post,
            &format!("{ES}/{INDEX}/_search"),
            &json!({"hits": {"hits": [
                {"_source": {"metadata": {"processing_version": "002.71"}}}
            ]}}),
        );
        let catalog = CatalogClient::new(ES, INDEX, transport.clone());
        let scraper = IpfScraper::new(transport.clone(), ASF);

        let err = scrape_ipf(&catalog, &scraper, &request(IpfEndpoint::Scihub)).await.unwrap_err();
        assert!(matches!(err, IpfError::AlreadyKnown(_)));
        assert_eq!(transport.requests().len(), 1);
    }
}
