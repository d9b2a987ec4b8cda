//! HTTP client for REST endpoints.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use fleetrun_core::{
    Agent, AgentSpec, CompletionReport, DeadLetterEntry, DeregisterResponse, ErrorResponse,
    FailureReport, ManualScalingRequest, ScalingDecision, SubmitRequest, SubmitResponse, Task,
    TaskAccepted, TaskSpec, TaskStatus,
};

use crate::error::ClientError;

/// HTTP client for the control plane's REST API.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if the control plane is healthy.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let url = self.url("/health");
        debug!(url = %url, "Checking health");

        let response = self.inner.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    /// Submit a batch. The batch is accepted or rejected as a whole.
    pub async fn submit(&self, tasks: Vec<TaskSpec>) -> Result<Vec<TaskAccepted>, ClientError> {
        let response: SubmitResponse = self
            .post_json("/v1/tasks", &SubmitRequest { tasks })
            .await?;
        Ok(response.tasks)
    }

    pub async fn task(&self, id: &str) -> Result<Task, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}")).await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, ClientError> {
        let mut query = Vec::new();
        if let Some(status) = status {
            query.push(format!("status={}", status.as_label()));
        }
        if let Some(limit) = limit {
            query.push(format!("limit={limit}"));
        }
        let path = if query.is_empty() {
            "/v1/tasks".to_string()
        } else {
            format!("/v1/tasks?{}", query.join("&"))
        };
        self.get_json(&path).await
    }

    pub async fn cancel(&self, id: &str) -> Result<Task, ClientError> {
        self.post_empty(&format!("/v1/tasks/{id}/cancel")).await
    }

    /// Report a successful execution on behalf of an agent.
    pub async fn complete(&self, id: &str, report: &CompletionReport) -> Result<Task, ClientError> {
        self.post_json(&format!("/v1/tasks/{id}/complete"), report).await
    }

    /// Report a failed execution on behalf of an agent.
    pub async fn fail(&self, id: &str, report: &FailureReport) -> Result<Task, ClientError> {
        self.post_json(&format!("/v1/tasks/{id}/fail"), report).await
    }

    pub async fn critical_path(&self) -> Result<Value, ClientError> {
        self.get_json("/v1/critical-path").await
    }

    // ---------------------------------------------------------------------
    // Agents
    // ---------------------------------------------------------------------

    pub async fn agents(&self) -> Result<Vec<Agent>, ClientError> {
        self.get_json("/v1/agents").await
    }

    pub async fn agent(&self, id: &str) -> Result<Agent, ClientError> {
        self.get_json(&format!("/v1/agents/{id}")).await
    }

    pub async fn register_agent(&self, spec: &AgentSpec) -> Result<Agent, ClientError> {
        self.post_json("/v1/agents", spec).await
    }

    /// Deregister an agent. `reason` is one of `shutdown`, `unhealthy` or
    /// `completed_elsewhere`.
    pub async fn deregister_agent(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<DeregisterResponse, ClientError> {
        let path = format!("/v1/agents/{id}?reason={reason}");
        self.send(self.request(Method::DELETE, &path)).await
    }

    pub async fn heartbeat(&self, id: &str) -> Result<Agent, ClientError> {
        self.post_empty(&format!("/v1/agents/{id}/heartbeat")).await
    }

    // ---------------------------------------------------------------------
    // Dead letters
    // ---------------------------------------------------------------------

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, ClientError> {
        self.get_json("/v1/dead-letters").await
    }

    pub async fn dead_letter(&self, id: &str) -> Result<DeadLetterEntry, ClientError> {
        self.get_json(&format!("/v1/dead-letters/{id}")).await
    }

    /// Resubmit a dead-lettered task as a new task.
    pub async fn reprocess(&self, id: &str) -> Result<Task, ClientError> {
        self.post_empty(&format!("/v1/dead-letters/{id}/reprocess")).await
    }

    // ---------------------------------------------------------------------
    // Autoscaling
    // ---------------------------------------------------------------------

    pub async fn features(&self, limit: usize) -> Result<Value, ClientError> {
        self.get_json(&format!("/v1/features?limit={limit}")).await
    }

    pub async fn forecast(&self) -> Result<Value, ClientError> {
        self.get_json("/v1/forecast").await
    }

    pub async fn scaling_decisions(&self, limit: usize) -> Result<Vec<ScalingDecision>, ClientError> {
        self.get_json(&format!("/v1/scaling/decisions?limit={limit}")).await
    }

    pub async fn manual_scaling(
        &self,
        agent_type: &str,
        target: u32,
    ) -> Result<ScalingDecision, ClientError> {
        let body = ManualScalingRequest {
            agent_type: agent_type.to_string(),
            target,
        };
        self.post_json("/v1/scaling/manual", &body).await
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    /// Get JSON from an endpoint.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(self.request(Method::GET, path)).await
    }

    /// Post a JSON body and decode the JSON response.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(self.request(Method::POST, path)).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        debug!(method = %method, url = %url, "HTTP request");
        self.inner.request(method, url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

/// Decode the control plane's `{"error": ...}` body, falling back to the raw text.
async fn api_error(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    ClientError::Api { status, message }
}
