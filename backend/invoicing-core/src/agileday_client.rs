// src/agileday_client.rs

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use url::Url;

use crate::error::InvoicingError;
use crate::time_entry::{lenient_text, RawTimeEntry};

const CLIENT_USER_AGENT: &str = concat!("billable-invoicing/", env!("CARGO_PKG_VERSION"));

// --- Data Structures ---

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompanyRef {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
}

/// The parts of an AgileDay project record this tool looks at.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default, deserialize_with = "lenient_text")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient_text")]
    pub project_type: Option<String>,
    #[serde(default)]
    pub company: Option<CompanyRef>,
}

impl ProjectMetadata {
    pub fn company_name(&self) -> Option<&str> {
        self.company.as_ref().and_then(|c| c.name.as_deref())
    }
}

// --- Time source seam ---

#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn fetch_entries(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        status: &str,
    ) -> Result<Vec<RawTimeEntry>, InvoicingError>;

    async fn fetch_project(&self, project_id: &str) -> Result<ProjectMetadata, InvoicingError>;
}

// --- AgileDay HTTP client ---

/// `abcd...wxyz`, or `***` for short tokens.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "***".to_string()
    }
}

pub struct AgileDayClient {
    http_client: Client,
    base_url: String,
    token: String,
    masked_token: String,
}

impl AgileDayClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, InvoicingError> {
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(InvoicingError::MissingEnvVar("AGILEDAY_TOKEN".into()));
        }
        Url::parse(base_url)?;
        let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let masked_token = mask_token(&token);
        debug!("Using API token: {}", masked_token);
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            masked_token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, InvoicingError> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url,
            path.trim_start_matches('/')
        ))?)
    }

    pub fn time_reporting_url(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        status: &str,
    ) -> Result<Url, InvoicingError> {
        let mut url = self.endpoint("time_reporting")?;
        url.query_pairs_mut()
            .append_pair("startDate", &start.format("%Y-%m-%d").to_string())
            .append_pair("endDate", &end.format("%Y-%m-%d").to_string())
            .append_pair("status", status);
        Ok(url)
    }

    pub fn project_url(&self, project_id: &str) -> Result<Url, InvoicingError> {
        let mut url = self.endpoint("project/id")?;
        url.path_segments_mut()
            .map_err(|_| InvoicingError::ConfigError(format!("Cannot use {} as a base URL", self.base_url)))?
            .push(project_id);
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        debug!(
            "Making GET request to {} (Authorization: Bearer {})",
            url, self.masked_token
        );
        self.http_client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_USER_AGENT)
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, InvoicingError> {
        let request = request_builder.build()?;
        let request_url = request.url().to_string();

        let resp = match self.http_client.execute(request).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    "HTTP execution failed before receiving response for '{}' (URL: {}): {}",
                    context_msg, request_url, e
                );
                return Err(InvoicingError::Request(e));
            }
        };

        let status = resp.status();
        debug!(
            "Received response for '{}' (URL: {}): Status={}",
            context_msg, request_url, status
        );
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            match status {
                StatusCode::UNAUTHORIZED => error!(
                    "Authentication failed. Please check your AGILEDAY_TOKEN. Response: {}",
                    message
                ),
                StatusCode::NOT_FOUND => {
                    error!("API endpoint not found. Response: {}", message)
                }
                _ => error!(
                    "API Error Response: Status={}, Body='{}' for URL: {}",
                    status, message, request_url
                ),
            }
            return Err(InvoicingError::ApiError { status, message });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice::<T>(&bytes).map_err(|e| {
            error!(
                "JSON deserialization failed for '{}' (URL: {}): {}",
                context_msg, request_url, e
            );
            InvoicingError::Json(e)
        })
    }
}

#[async_trait]
impl TimeSource for AgileDayClient {
    async fn fetch_entries(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        status: &str,
    ) -> Result<Vec<RawTimeEntry>, InvoicingError> {
        info!(
            "Fetching time entries between {} and {} with status {}",
            start, end, status
        );
        let url = self.time_reporting_url(start, end, status)?;
        let entries: Vec<RawTimeEntry> = self
            .send_and_deserialize(self.get(url), "Get time entries")
            .await?;
        debug!("Retrieved {} time entries", entries.len());
        Ok(entries)
    }

    async fn fetch_project(&self, project_id: &str) -> Result<ProjectMetadata, InvoicingError> {
        let url = self.project_url(project_id)?;
        debug!("Fetching project details from {}", url);
        self.send_and_deserialize(self.get(url), "Get project").await
    }
}

// --- Per-run project cache ---

/// Remembers every project fetched through it for the lifetime of the run.
pub struct CachingTimeSource<S> {
    inner: S,
    projects: Mutex<HashMap<String, ProjectMetadata>>,
}

impl<S: TimeSource> CachingTimeSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cached_projects(&self) -> usize {
        self.projects.lock().await.len()
    }
}

#[async_trait]
impl<S: TimeSource> TimeSource for CachingTimeSource<S> {
    async fn fetch_entries(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        status: &str,
    ) -> Result<Vec<RawTimeEntry>, InvoicingError> {
        self.inner.fetch_entries(start, end, status).await
    }

    async fn fetch_project(&self, project_id: &str) -> Result<ProjectMetadata, InvoicingError> {
        if let Some(project) = self.projects.lock().await.get(project_id) {
            debug!("Project {} served from cache", project_id);
            return Ok(project.clone());
        }
        let project = self.inner.fetch_project(project_id).await?;
        self.projects
            .lock()
            .await
            .insert(project_id.to_string(), project.clone());
        Ok(project)
    }
}
