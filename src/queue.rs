//! The task queue's own view of a job.
//!
//! The queue forgets results across restarts and then reports finished jobs
//! as `PENDING`, so its answer is the least trusted tier.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::QueueError;
use crate::state::{JobState, error_message_from};

/// State labels reported by the queue backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Started,
    Retry,
    /// Custom state set by workers that report progress.
    Running,
    Success,
    Failure,
    Revoked,
    Unknown(String),
}

impl QueueState {
    /// Total mapping from a raw label; case-insensitive.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "PENDING" => QueueState::Pending,
            "STARTED" => QueueState::Started,
            "RETRY" => QueueState::Retry,
            "RUNNING" => QueueState::Running,
            "SUCCESS" => QueueState::Success,
            "FAILURE" => QueueState::Failure,
            "REVOKED" => QueueState::Revoked,
            _ => QueueState::Unknown(label.trim().to_string()),
        }
    }

    /// The job state this label stands for. Unknown labels read as pending.
    pub fn job_state(&self) -> JobState {
        match self {
            QueueState::Pending | QueueState::Unknown(_) => JobState::Pending,
            QueueState::Started | QueueState::Retry | QueueState::Running => JobState::Running,
            QueueState::Success => JobState::Success,
            QueueState::Failure => JobState::Failure,
            QueueState::Revoked => JobState::Revoked,
        }
    }

    /// Matches [`Self::job_state`]: unknown labels count as pending.
    pub fn is_pending(&self) -> bool {
        matches!(self, QueueState::Pending | QueueState::Unknown(_))
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Pending => write!(f, "PENDING"),
            QueueState::Started => write!(f, "STARTED"),
            QueueState::Retry => write!(f, "RETRY"),
            QueueState::Running => write!(f, "RUNNING"),
            QueueState::Success => write!(f, "SUCCESS"),
            QueueState::Failure => write!(f, "FAILURE"),
            QueueState::Revoked => write!(f, "REVOKED"),
            QueueState::Unknown(label) => write!(f, "{label}"),
        }
    }
}

/// A queue status answer: the state plus the opaque result payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueReport {
    pub state: QueueState,
    pub result: Option<Value>,
}

impl QueueReport {
    pub fn new(state: QueueState) -> Self {
        Self {
            state,
            result: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// The payload as a JSON object. Workers return it either as an object
    /// or as a JSON-encoded string.
    pub fn payload(&self) -> Option<Map<String, Value>> {
        match self.result.as_ref()? {
            Value::Object(map) => Some(map.clone()),
            Value::String(s) => match serde_json::from_str(s) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        if let Some(payload) = self.payload() {
            return error_message_from(&payload);
        }
        // A failed task's result is usually the exception text itself.
        match &self.result {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    /// Unix seconds at which the worker produced the result, if it said so.
    pub fn created_on(&self) -> Option<i64> {
        self.payload()?.get("created_on")?.as_i64()
    }

    /// Unix seconds after which the worker's result folder is due for cleanup.
    pub fn expires_on(&self) -> Option<i64> {
        self.payload()?.get("expires_on")?.as_i64()
    }

    /// Lifetime of the result folder in seconds, as the worker announced it.
    pub fn expires_in(&self) -> Option<i64> {
        self.payload()?.get("expires_in")?.as_i64()
    }
}

impl From<QueueState> for QueueReport {
    fn from(state: QueueState) -> Self {
        QueueReport::new(state)
    }
}

impl From<&str> for QueueReport {
    fn from(label: &str) -> Self {
        QueueReport::new(QueueState::from_label(label))
    }
}

/// Anything that can tell us what the queue thinks of a job.
pub trait QueueBackend {
    fn status(&self, job_id: &str) -> impl Future<Output = Result<QueueReport, QueueError>> + Send;
}

/// Body of `GET /api/task/result/{id}` on the queue monitor.
#[derive(Debug, Deserialize)]
struct TaskResultResponse {
    state: String,
    #[serde(default)]
    result: Option<Value>,
}

/// Queue backend read through the monitor's HTTP API.
pub struct HttpQueueBackend {
    client: Client,
    base_url: Url,
}

impl HttpQueueBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, QueueError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| QueueError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(QueueError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { client, base_url })
    }

    /// `<base>/api/task/result/<job_id>`, with the id percent-encoded as a
    /// single path segment.
    fn result_url(&self, job_id: &str) -> Result<Url, QueueError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| QueueError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "task", "result", job_id]);
        Ok(url)
    }
}

impl QueueBackend for HttpQueueBackend {
    async fn status(&self, job_id: &str) -> Result<QueueReport, QueueError> {
        let url = self.result_url(job_id)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();

        // The monitor has never heard of the id: the queue calls that pending.
        if status == StatusCode::NOT_FOUND {
            debug!(job_id, "queue monitor does not know the job");
            return Ok(QueueReport::new(QueueState::Pending));
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(QueueError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<TaskResultResponse>()
            .await
            .map_err(|e| QueueError::Parse(e.to_string()))?;
        let mut report = QueueReport::new(QueueState::from_label(&body.state));
        report.result = body.result.filter(|v| !v.is_null());
        debug!(job_id, state = %report.state, "queue reported job state");
        Ok(report)
    }
}
