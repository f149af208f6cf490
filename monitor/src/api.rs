//! REST client for the PageLens job API.
//!
//! Covers job submission (page analysis uploads, script runs and test case
//! generation), record polling for the fallback path, and cancellation. The monitor depends only on
//! the [`JobApi`] trait; [`HttpJobApi`] is the reqwest-backed implementation.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pagelens_monitor::api::{AnalysisUpload, HttpJobApi, JobKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let api = HttpJobApi::new(
//!         "http://localhost:8000",
//!         JobKind::PageAnalysis,
//!         Duration::from_secs(30),
//!     )
//!     .unwrap();
//!
//!     let handle = api
//!         .submit_page_analysis(&AnalysisUpload::new("login.png").with_page_name("Login"))
//!         .await
//!         .unwrap();
//!     println!("session {}", handle.session_id);
//! }
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::{fill_session_id, resolve_url};
use crate::types::{JobHandle, JobRecord};

/// Upload endpoint for page screenshots.
const UPLOAD_PATH: &str = "/api/v1/web/page-analysis/upload-and-analyze";

/// Single script execution endpoint.
const EXECUTE_PATH: &str = "/api/v1/web/execution/execute-by-id";

/// Batch script execution endpoint.
const BATCH_EXECUTE_PATH: &str = "/api/v1/web/execution/batch-execute-by-ids";

/// Test case generation from a screenshot and description.
const TEST_CASE_IMAGE_PATH: &str = "/api/v1/web/test-case-creation/analyze-image";

/// Test case generation from a description only.
const TEST_CASE_TEXT_PATH: &str = "/api/v1/web/test-case-creation/analyze-text";

/// Errors that can occur when talking to the job API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Reading a local upload failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The backend has no endpoint for this operation on this job kind.
    #[error("{operation} is not supported for {kind} jobs")]
    Unsupported {
        operation: &'static str,
        kind: JobKind,
    },
}

/// REST operations the monitor needs from the backend.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Fetches the records used to detect a terminal state for `session_id`.
    async fn poll_records(&self, session_id: &str) -> Result<Vec<JobRecord>, ApiError>;

    /// Fetches the job listing shown next to the live view.
    async fn list_records(&self) -> Result<Vec<JobRecord>, ApiError>;

    /// Asks the backend to stop `session_id`.
    async fn cancel(&self, session_id: &str) -> Result<(), ApiError>;
}

/// The job families the backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PageAnalysis,
    ScriptExecution,
    TestCaseCreation,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageAnalysis => f.write_str("page-analysis"),
            Self::ScriptExecution => f.write_str("script"),
            Self::TestCaseCreation => f.write_str("test-case"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "page-analysis" | "analysis" => Ok(Self::PageAnalysis),
            "script" | "execution" => Ok(Self::ScriptExecution),
            "test-case" | "test-case-creation" | "testcase" => Ok(Self::TestCaseCreation),
            other => Err(format!(
                "unknown job kind '{other}', expected 'page-analysis', 'script' or 'test-case'"
            )),
        }
    }
}

/// Where poll records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSource {
    /// A listing that may contain the session among others.
    List(String),
    /// A per-session detail endpoint; contains `{session_id}`.
    Detail(String),
}

/// Request used to stop a session; the path contains `{session_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRoute {
    pub method: Method,
    pub path: String,
}

/// Endpoint layout for one [`JobKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRoutes {
    pub kind: JobKind,
    /// Push stream template.
    pub stream: String,
    pub records: RecordSource,
    /// Listing refreshed while the fallback is active, if the kind has one.
    pub listing: Option<String>,
    pub cancel: Option<CancelRoute>,
}

impl JobRoutes {
    /// Returns the backend routes for `kind`.
    #[must_use]
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::PageAnalysis => {
                let pages = "/api/v1/web/page-analysis/pages?page=1&page_size=10".to_string();
                Self {
                    kind,
                    stream: "/api/v1/web/page-analysis/stream/{session_id}".to_string(),
                    records: RecordSource::List(pages.clone()),
                    listing: Some(pages),
                    cancel: Some(CancelRoute {
                        method: Method::DELETE,
                        path: "/api/v1/web/page-analysis/sessions/{session_id}".to_string(),
                    }),
                }
            }
            JobKind::ScriptExecution => Self {
                kind,
                stream: "/api/v1/web/execution/stream/{session_id}".to_string(),
                records: RecordSource::Detail(
                    "/api/v1/web/execution/sessions/{session_id}".to_string(),
                ),
                listing: Some("/api/v1/web/execution/sessions".to_string()),
                cancel: Some(CancelRoute {
                    method: Method::POST,
                    path: "/api/v1/web/execution/sessions/{session_id}/stop".to_string(),
                }),
            },
            // Test case sessions expire on the backend; there is no stop route.
            JobKind::TestCaseCreation => Self {
                kind,
                stream: "/api/v1/web/test-case-creation/stream/{session_id}".to_string(),
                records: RecordSource::Detail(
                    "/api/v1/web/test-case-creation/status/{session_id}".to_string(),
                ),
                listing: None,
                cancel: None,
            },
        }
    }
}

/// A screenshot to submit for analysis.
#[derive(Debug, Clone)]
pub struct AnalysisUpload {
    pub path: PathBuf,
    pub page_name: Option<String>,
    pub description: Option<String>,
    pub page_url: Option<String>,
}

impl AnalysisUpload {
    /// Creates an upload for the image at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_name: None,
            description: None,
            page_url: None,
        }
    }

    #[must_use]
    pub fn with_page_name(mut self, page_name: impl Into<String>) -> Self {
        self.page_name = Some(page_name.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Body of a single script execution request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptExecutionRequest {
    pub script_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_config: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<Map<String, Value>>,
}

impl ScriptExecutionRequest {
    #[must_use]
    pub fn new(script_id: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            ..Self::default()
        }
    }
}

/// Body of a batch script execution request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchExecutionRequest {
    pub script_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_config: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<Map<String, Value>>,
    pub parallel: bool,
    pub continue_on_error: bool,
}

/// A test case generation request.
///
/// The screenshot is optional; without one the description alone drives the
/// analysis.
#[derive(Debug, Clone)]
pub struct TestCaseRequest {
    pub description: String,
    pub image: Option<PathBuf>,
    pub additional_context: Option<String>,
    /// Comma separated output formats, e.g. `yaml,playwright`.
    pub formats: String,
    pub save_to_database: bool,
    pub script_name: Option<String>,
    pub script_description: Option<String>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub priority: Option<u8>,
}

impl TestCaseRequest {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            image: None,
            additional_context: None,
            formats: "yaml".to_string(),
            save_to_database: true,
            script_name: None,
            script_description: None,
            tags: Vec::new(),
            category: None,
            priority: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_formats(mut self, formats: impl Into<String>) -> Self {
        self.formats = formats.into();
        self
    }

    #[must_use]
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    /// Field pairs shared by the form and query encodings.
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("test_description", self.description.clone()),
            ("generate_formats", self.formats.clone()),
            ("save_to_database", self.save_to_database.to_string()),
        ];
        let optional = [
            ("additional_context", self.additional_context.clone()),
            ("script_name", self.script_name.clone()),
            ("script_description", self.script_description.clone()),
            ("category", self.category.clone()),
            ("priority", self.priority.map(|p| p.to_string())),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|value| (key, value))),
        );
        if !self.tags.is_empty() {
            fields.push(("tags", self.tags.join(",")));
        }
        fields
    }
}

/// reqwest-backed [`JobApi`].
#[derive(Debug, Clone)]
pub struct HttpJobApi {
    client: Client,
    base_url: String,
    routes: JobRoutes,
}

impl HttpJobApi {
    /// Creates a client for `kind` against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        kind: JobKind,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            routes: JobRoutes::for_kind(kind),
        })
    }

    /// Returns the routes this client uses.
    #[must_use]
    pub fn routes(&self) -> &JobRoutes {
        &self.routes
    }

    /// Uploads a screenshot and starts an analysis job.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the request fails, or the
    /// response lacks a session id.
    pub async fn submit_page_analysis(&self, upload: &AnalysisUpload) -> Result<JobHandle, ApiError> {
        let mut form = Form::new().part("files", image_part(&upload.path).await?);
        if let Some(page_name) = &upload.page_name {
            form = form.text("page_name", page_name.clone());
        }
        if let Some(description) = &upload.description {
            form = form.text("description", description.clone());
        }
        if let Some(page_url) = &upload.page_url {
            form = form.text("page_url", page_url.clone());
        }

        let response = self
            .client
            .post(self.url(UPLOAD_PATH))
            .multipart(form)
            .send()
            .await?;

        let handle = handle_from_value(checked_json(response).await?)?;
        info!(session_id = %handle.session_id, "Page analysis submitted");
        Ok(handle)
    }

    /// Starts a single script run.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response lacks a session id.
    pub async fn execute_script(
        &self,
        request: &ScriptExecutionRequest,
    ) -> Result<JobHandle, ApiError> {
        let response = self
            .client
            .post(self.url(EXECUTE_PATH))
            .json(request)
            .send()
            .await?;

        let handle = handle_from_value(checked_json(response).await?)?;
        info!(session_id = %handle.session_id, script_id = %request.script_id, "Script execution started");
        Ok(handle)
    }

    /// Starts a batch of script runs under one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response lacks a session id.
    pub async fn batch_execute(&self, request: &BatchExecutionRequest) -> Result<JobHandle, ApiError> {
        let response = self
            .client
            .post(self.url(BATCH_EXECUTE_PATH))
            .json(request)
            .send()
            .await?;

        let handle = handle_from_value(checked_json(response).await?)?;
        info!(
            session_id = %handle.session_id,
            script_count = request.script_ids.len(),
            "Batch execution started"
        );
        Ok(handle)
    }

    /// Starts test case generation.
    ///
    /// With an image the request goes out as a multipart upload; a
    /// description-only request is sent as query parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be read, the request fails, or the
    /// response lacks a session id.
    pub async fn submit_test_cases(&self, request: &TestCaseRequest) -> Result<JobHandle, ApiError> {
        let response = match &request.image {
            Some(path) => {
                let mut form = Form::new().part("file", image_part(path).await?);
                for (key, value) in request.fields() {
                    form = form.text(key, value);
                }
                self.client
                    .post(self.url(TEST_CASE_IMAGE_PATH))
                    .multipart(form)
                    .send()
                    .await?
            }
            None => {
                self.client
                    .post(self.url(TEST_CASE_TEXT_PATH))
                    .query(&request.fields())
                    .send()
                    .await?
            }
        };

        let handle = handle_from_value(checked_json(response).await?)?;
        info!(
            session_id = %handle.session_id,
            has_image = request.image.is_some(),
            "Test case generation started"
        );
        Ok(handle)
    }

    async fn fetch_records(&self, path: &str) -> Result<Vec<JobRecord>, ApiError> {
        let response = self.client.get(self.url(path)).send().await?;
        let records = records_from_value(checked_json(response).await?)?;
        debug!(path, count = records.len(), "Fetched job records");
        Ok(records)
    }

    fn url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn poll_records(&self, session_id: &str) -> Result<Vec<JobRecord>, ApiError> {
        let path = match &self.routes.records {
            RecordSource::List(path) => path.clone(),
            RecordSource::Detail(template) => fill_session_id(template, session_id),
        };
        self.fetch_records(&path).await
    }

    async fn list_records(&self) -> Result<Vec<JobRecord>, ApiError> {
        match &self.routes.listing {
            Some(path) => self.fetch_records(path).await,
            None => Ok(Vec::new()),
        }
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ApiError> {
        let route = self.routes.cancel.as_ref().ok_or(ApiError::Unsupported {
            operation: "cancel",
            kind: self.routes.kind,
        })?;
        let path = fill_session_id(&route.path, session_id);
        let response = self
            .client
            .request(route.method.clone(), self.url(&path))
            .send()
            .await?;

        checked_json(response).await?;
        info!(session_id, "Cancellation acknowledged by backend");
        Ok(())
    }
}

/// Returns the JSON body, or a [`ApiError::ServerError`] for non-success
/// statuses. An empty success body is returned as `null`.
async fn checked_json(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(ApiError::ServerError {
            status: status.as_u16(),
            message: error_detail(&body),
        });
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| ApiError::UnexpectedResponse(e.to_string()))
}

/// Extracts a readable message from an error body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Reads a submission response, which is either wrapped in `data` or flat.
pub(crate) fn handle_from_value(value: Value) -> Result<JobHandle, ApiError> {
    let inner = match value.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => value,
    };

    serde_json::from_value(inner)
        .map_err(|e| ApiError::UnexpectedResponse(format!("missing session fields: {e}")))
}

/// Builds a multipart file part for the image at `path`.
async fn image_part(path: &Path) -> Result<Part, ApiError> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map_or_else(|| "upload".to_string(), |name| name.to_string_lossy().into_owned());

    Ok(Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(guess_mime(path))?)
}

/// Reads job records from any of the listing shapes the backend returns.
pub(crate) fn records_from_value(value: Value) -> Result<Vec<JobRecord>, ApiError> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            if let Some(Value::Array(items)) = map.remove("data") {
                items
            } else if let Some(Value::Object(sessions)) = map.remove("sessions") {
                sessions
                    .into_iter()
                    .map(|(session_id, mut info)| {
                        if let Value::Object(fields) = &mut info {
                            fields
                                .entry("session_id")
                                .or_insert_with(|| Value::String(session_id));
                        }
                        info
                    })
                    .collect()
            } else if let Some(info) = map.remove("session_info") {
                vec![info]
            } else if map.contains_key("session_id") {
                // Flat status document for a single session.
                vec![Value::Object(map)]
            } else {
                return Err(ApiError::UnexpectedResponse(
                    "response contains no job records".to_string(),
                ));
            }
        }
        other => {
            return Err(ApiError::UnexpectedResponse(format!(
                "expected records, got {other}"
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| ApiError::UnexpectedResponse(e.to_string()))
        })
        .collect()
}

fn guess_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}
