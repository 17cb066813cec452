//! Graph API adapter: lead form discovery, qualifier metadata and paginated lead pulls.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadsync_core::RawLead;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

/// Fields requested for every lead pull.
pub const LEAD_REQUEST_FIELDS: &str =
    "created_time,field_data,ad_id,ad_name,campaign_id,campaign_name";

#[derive(Debug, Error)]
pub enum GraphError {
    /// `source` has its URL stripped; `url` never carries the query string.
    #[error("graph request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("graph returned http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("could not decode graph response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no fixture registered for {0}")]
    MissingFixture(String),
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v2.12".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl GraphConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Envelope shared by Graph list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
}

impl<T> GraphResponse<T> {
    pub fn next_page(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteForm {
    pub id: String,
    pub name: String,
}

/// A declared input of a lead form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualifier {
    pub field_key: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Deserialize)]
struct QualifiersEnvelope {
    #[serde(default)]
    qualifiers: Option<Vec<Qualifier>>,
}

#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn leadgen_forms(
        &self,
        page_name: &str,
        access_token: &str,
    ) -> Result<Vec<RemoteForm>, GraphError>;

    async fn form_qualifiers(
        &self,
        external_form_id: &str,
        access_token: &str,
    ) -> Result<Vec<Qualifier>, GraphError>;

    async fn form_leads(
        &self,
        external_form_id: &str,
        access_token: &str,
    ) -> Result<GraphResponse<RawLead>, GraphError>;

    /// Fetches a `paging.next` URL as returned by the API, which already carries its token.
    async fn follow_page(&self, next_url: &str) -> Result<GraphResponse<RawLead>, GraphError>;
}

/// Flattens `field_data: [{name, values: [..]}]` into top-level keys.
///
/// The first value of each entry is kept. Entries without a name or values are dropped,
/// and an entry never replaces a key already present at the top level.
pub fn flatten_field_data(lead: RawLead) -> RawLead {
    let mut flat = RawLead::new();
    let mut field_data = None;
    for (key, value) in lead {
        if key == "field_data" {
            field_data = Some(value);
        } else {
            flat.insert(key, value);
        }
    }

    let entries = match field_data {
        Some(JsonValue::Array(entries)) => entries,
        _ => return flat,
    };
    for entry in entries {
        let Some(name) = entry.get("name").and_then(JsonValue::as_str) else {
            continue;
        };
        if name.is_empty() || flat.contains_key(name) {
            continue;
        }
        let first = entry
            .get("values")
            .and_then(JsonValue::as_array)
            .and_then(|values| values.first());
        if let Some(value) = first {
            flat.insert(name.to_string(), value.clone());
        }
    }
    flat
}

#[derive(Debug)]
pub struct GraphClient {
    client: reqwest::Client,
    config: GraphConfig,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Self, GraphError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| request_error(&config.base_url, err))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, GraphError> {
        let url_for_logs = redact_query(url);
        let span = info_span!("graph_get", url = %url_for_logs);
        async move {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|err| request_error(&url_for_logs, err))?;
            let status = resp.status();
            let body = resp
                .bytes()
                .await
                .map_err(|err| request_error(&url_for_logs, err))?;
            debug!(status = status.as_u16(), bytes = body.len(), "graph response");

            if !status.is_success() {
                return Err(GraphError::HttpStatus {
                    status: status.as_u16(),
                    url: url_for_logs,
                    message: graph_error_message(&body),
                });
            }

            serde_json::from_slice(&body).map_err(|source| GraphError::Decode {
                url: url_for_logs,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

fn request_error(url: &str, err: reqwest::Error) -> GraphError {
    GraphError::Request {
        url: redact_query(url),
        source: err.without_url(),
    }
}

fn redact_query(url: &str) -> String {
    url.split('?').next().unwrap_or_default().to_string()
}

fn graph_error_message(body: &[u8]) -> String {
    serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(200).collect())
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn leadgen_forms(
        &self,
        page_name: &str,
        access_token: &str,
    ) -> Result<Vec<RemoteForm>, GraphError> {
        let url = self.config.endpoint(&format!("{page_name}/leadgen_forms"));
        let resp: GraphResponse<RemoteForm> = self
            .get_json(&url, &[("access_token", access_token)])
            .await?;
        Ok(resp.data)
    }

    async fn form_qualifiers(
        &self,
        external_form_id: &str,
        access_token: &str,
    ) -> Result<Vec<Qualifier>, GraphError> {
        let url = self.config.endpoint(external_form_id);
        let resp: QualifiersEnvelope = self
            .get_json(&url, &[("access_token", access_token), ("fields", "qualifiers")])
            .await?;
        Ok(resp.qualifiers.unwrap_or_default())
    }

    async fn form_leads(
        &self,
        external_form_id: &str,
        access_token: &str,
    ) -> Result<GraphResponse<RawLead>, GraphError> {
        let url = self.config.endpoint(&format!("{external_form_id}/leads"));
        self.get_json(
            &url,
            &[("access_token", access_token), ("fields", LEAD_REQUEST_FIELDS)],
        )
        .await
    }

    async fn follow_page(&self, next_url: &str) -> Result<GraphResponse<RawLead>, GraphError> {
        self.get_json(next_url, &[]).await
    }
}

/// On-disk fixture describing what a Graph account returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFixture {
    /// Page name to its lead forms.
    #[serde(default)]
    pub forms: HashMap<String, Vec<RemoteForm>>,
    /// External form id to its qualifiers.
    #[serde(default)]
    pub qualifiers: HashMap<String, Vec<Qualifier>>,
    /// External form id to successive pages of raw leads.
    #[serde(default)]
    pub leads: HashMap<String, Vec<Vec<RawLead>>>,
}

/// [`GraphApi`] served from canned data. Lead pages are chained through synthetic
/// `fixture://` next links so pagination behaves like the live API.
#[derive(Debug, Default)]
pub struct FixtureGraph {
    forms: HashMap<String, Vec<RemoteForm>>,
    qualifiers: HashMap<String, Vec<Qualifier>>,
    lead_pages: HashMap<String, GraphResponse<RawLead>>,
    failures: HashMap<String, String>,
    requests: Mutex<Vec<String>>,
}

impl FixtureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: GraphFixture) -> Self {
        let mut graph = Self::new();
        for (page, forms) in fixture.forms {
            graph = graph.with_forms(&page, forms);
        }
        for (form, qualifiers) in fixture.qualifiers {
            graph = graph.with_qualifiers(&form, qualifiers);
        }
        for (form, pages) in fixture.leads {
            graph = graph.with_lead_pages(&form, pages);
        }
        graph
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let fixture: GraphFixture =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_forms(mut self, page_name: &str, forms: Vec<RemoteForm>) -> Self {
        self.forms.insert(page_name.to_string(), forms);
        self
    }

    pub fn with_qualifiers(mut self, external_form_id: &str, qualifiers: Vec<Qualifier>) -> Self {
        self.qualifiers
            .insert(external_form_id.to_string(), qualifiers);
        self
    }

    pub fn with_lead_pages(mut self, external_form_id: &str, pages: Vec<Vec<RawLead>>) -> Self {
        let total = pages.len();
        for (index, data) in pages.into_iter().enumerate() {
            let next = (index + 1 < total).then(|| fixture_page_url(external_form_id, index + 1));
            let key = if index == 0 {
                external_form_id.to_string()
            } else {
                fixture_page_url(external_form_id, index)
            };
            self.lead_pages.insert(
                key,
                GraphResponse {
                    data,
                    paging: next.map(|next| Paging { next: Some(next) }),
                },
            );
        }
        self
    }

    /// Makes every request for this form id or page name fail with an HTTP 400.
    pub fn with_failure(mut self, key: &str, message: &str) -> Self {
        self.failures.insert(key.to_string(), message.to_string());
        self
    }

    /// Request log, one entry per call, in call order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }

    async fn record(&self, request: String) {
        self.requests.lock().await.push(request);
    }

    fn check_failure(&self, key: &str) -> Result<(), GraphError> {
        match self.failures.get(key) {
            Some(message) => Err(GraphError::HttpStatus {
                status: 400,
                url: format!("fixture://{key}"),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn fixture_page_url(external_form_id: &str, index: usize) -> String {
    format!("fixture://{external_form_id}/leads?page={index}")
}

#[async_trait]
impl GraphApi for FixtureGraph {
    async fn leadgen_forms(
        &self,
        page_name: &str,
        _access_token: &str,
    ) -> Result<Vec<RemoteForm>, GraphError> {
        self.record(format!("{page_name}/leadgen_forms")).await;
        self.check_failure(page_name)?;
        Ok(self.forms.get(page_name).cloned().unwrap_or_default())
    }

    async fn form_qualifiers(
        &self,
        external_form_id: &str,
        _access_token: &str,
    ) -> Result<Vec<Qualifier>, GraphError> {
        self.record(format!("{external_form_id}?fields=qualifiers")).await;
        self.check_failure(external_form_id)?;
        Ok(self
            .qualifiers
            .get(external_form_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn form_leads(
        &self,
        external_form_id: &str,
        _access_token: &str,
    ) -> Result<GraphResponse<RawLead>, GraphError> {
        self.record(format!("{external_form_id}/leads")).await;
        self.check_failure(external_form_id)?;
        Ok(self
            .lead_pages
            .get(external_form_id)
            .cloned()
            .unwrap_or(GraphResponse {
                data: Vec::new(),
                paging: None,
            }))
    }

    async fn follow_page(&self, next_url: &str) -> Result<GraphResponse<RawLead>, GraphError> {
        self.record(next_url.to_string()).await;
        self.check_failure(next_url)?;
        self.lead_pages
            .get(next_url)
            .cloned()
            .ok_or_else(|| GraphError::MissingFixture(next_url.to_string()))
    }
}
