//! Mozart job-submission client and payload model.

use std::sync::Arc;

use async_trait::async_trait;
use s1acq_storage::{FetchError, HttpRequest, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::info;

pub const SUBMIT_PATH: &str = "/mozart/api/v0.1/job/submit";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParam {
    pub name: String,
    pub from: String,
    pub value: JsonValue,
}

impl JobParam {
    pub fn value(name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            name: name.into(),
            from: "value".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPayload {
    pub job_type: String,
    pub release: String,
    pub queue: String,
    pub priority: u8,
    pub job_name: String,
    pub tags: Vec<String>,
    pub enable_dedup: bool,
    pub params: Vec<JobParam>,
}

impl JobPayload {
    pub fn new(
        job_type: impl Into<String>,
        release: impl Into<String>,
        queue: impl Into<String>,
        priority: u8,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            release: release.into(),
            queue: queue.into(),
            priority,
            job_name: String::new(),
            tags: Vec::new(),
            enable_dedup: true,
            params: Vec::new(),
        }
    }

    pub fn named(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = job_name.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.params.push(JobParam::value(name, value));
        self
    }

    /// `<job_type>:<release>`
    pub fn type_spec(&self) -> String {
        format!("{}:{}", self.job_type, self.release)
    }

    pub fn param_value(&self, name: &str) -> Option<&JsonValue> {
        self.params
            .iter()
            .rev()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    /// Resolved `name -> value` object; a repeated name keeps its last value.
    pub fn resolved_params(&self) -> JsonValue {
        let mut resolved = Map::new();
        for param in &self.params {
            resolved.insert(param.name.clone(), param.value.clone());
        }
        JsonValue::Object(resolved)
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("job not submitted successfully: {0}")]
    Rejected(JsonValue),
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Returns the orchestrator's job ID.
    async fn submit(&self, payload: &JobPayload) -> Result<String, SubmitError>;
}

pub struct MozartClient {
    base_url: String,
    transport: Arc<dyn Transport>,
}

impl MozartClient {
    pub fn new(base_url: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
        }
    }

    pub fn submit_url(&self) -> String {
        format!("{}{}", self.base_url, SUBMIT_PATH)
    }
}

#[async_trait]
impl JobSubmitter for MozartClient {
    async fn submit(&self, payload: &JobPayload) -> Result<String, SubmitError> {
        let tags = serde_json::to_string(&payload.tags).unwrap_or_else(|_| "[]".to_string());
        let request = HttpRequest::post(self.submit_url())
            .query("queue", payload.queue.clone())
            .query("priority", payload.priority.to_string())
            .query("job_name", payload.job_name.clone())
            .query("tags", tags)
            .query("type", payload.type_spec())
            .query("params", payload.resolved_params().to_string())
            .query("enable_dedup", payload.enable_dedup.to_string());

        let response = self.transport.send_json(request).await?;
        match (response.get("success"), response.get("result")) {
            (Some(JsonValue::Bool(true)), Some(result)) => {
                let job_id = result
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| result.to_string());
                info!(
                    job_type = %payload.type_spec(),
                    job_name = %payload.job_name,
                    %job_id,
                    "submitted job"
                );
                Ok(job_id)
            }
            _ => Err(SubmitError::Rejected(response)),
        }
    }
}
