//! Multi-channel human-in-the-loop approval queue.
//!
//! A request is broadcast to every registered notify channel, then response
//! channels are polled on a ~1 s tick until exactly one response arrives or
//! the timeout elapses. Notifications are best-effort: a channel that fails
//! to deliver is logged and skipped. Responses are first-writer-wins; later
//! submissions for the same request are dropped.

pub mod adapters;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

pub use adapters::{ApprovalAdapter, ChannelAdapter, CliAdapter};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Cancelled,
}

/// A request for human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub workflow_id: String,
    pub phase: String,
    pub question: String,
    pub options: Vec<String>,
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub timeout_minutes: u64,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    pub fn create(
        workflow_id: &str,
        phase: &str,
        question: &str,
        options: Option<Vec<String>>,
        context: Option<Map<String, Value>>,
        timeout_minutes: u64,
    ) -> Self {
        Self {
            id: format!("APR-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            workflow_id: workflow_id.to_string(),
            phase: phase.to_string(),
            question: question.to_string(),
            options: options
                .unwrap_or_else(|| vec!["approve".to_string(), "reject".to_string()]),
            context: context.unwrap_or_default(),
            created_at: Utc::now(),
            timeout_minutes,
            status: ApprovalStatus::Pending,
        }
    }
}

/// Response to an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: String,
    /// approve | reject | timeout | cancelled
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub responded_at: DateTime<Utc>,
}

impl ApprovalResponse {
    pub fn new(request_id: &str, decision: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            decision: decision.to_string(),
            comment: None,
            responder: None,
            channel: None,
            responded_at: Utc::now(),
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.decision == "approve"
    }
}

/// Unified approval queue with multi-channel notify and response support.
pub struct ApprovalQueue {
    notify_channels: Vec<String>,
    response_channels: Vec<String>,
    default_timeout_minutes: u64,
    adapters: HashMap<String, Arc<dyn ApprovalAdapter>>,
    pending: RwLock<HashMap<String, ApprovalRequest>>,
    responses: RwLock<HashMap<String, ApprovalResponse>>,
}

impl ApprovalQueue {
    pub fn new(
        notify_channels: Vec<String>,
        response_channels: Vec<String>,
        default_timeout_minutes: u64,
    ) -> Self {
        Self {
            notify_channels,
            response_channels,
            default_timeout_minutes,
            adapters: HashMap::new(),
            pending: RwLock::new(HashMap::new()),
            responses: RwLock::new(HashMap::new()),
        }
    }

    /// Register a channel adapter under its channel name.
    pub fn register_adapter(&mut self, adapter: Arc<dyn ApprovalAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Request human approval: broadcast to all notify channels, then await
    /// the first response from any response channel, a cancellation, or the
    /// timeout. Exactly one response is always returned.
    pub async fn request(
        &self,
        workflow_id: &str,
        phase: &str,
        question: &str,
        options: Option<Vec<String>>,
        context: Option<Map<String, Value>>,
        timeout_minutes: Option<u64>,
    ) -> ApprovalResponse {
        let request = ApprovalRequest::create(
            workflow_id,
            phase,
            question,
            options,
            context,
            timeout_minutes.unwrap_or(self.default_timeout_minutes),
        );
        let request_id = request.id.clone();

        self.pending
            .write()
            .await
            .insert(request_id.clone(), request.clone());

        self.send_notifications(&request).await;
        let response = self.wait_for_response(&request).await;

        self.pending.write().await.remove(&request_id);
        self.responses.write().await.remove(&request_id);

        response
    }

    /// Fan out notifications concurrently. Failures are logged and skipped.
    async fn send_notifications(&self, request: &ApprovalRequest) {
        let sends = self.notify_channels.iter().filter_map(|channel| {
            self.adapters.get(channel).map(|adapter| {
                let adapter = Arc::clone(adapter);
                let channel = channel.clone();
                let request = request.clone();
                async move {
                    if let Err(e) = adapter.send_notification(&request).await {
                        warn!(channel = %channel, error = %e, "Failed to send approval notification");
                    }
                }
            })
        });
        futures::future::join_all(sends).await;
    }

    async fn wait_for_response(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let timeout = Duration::from_secs(request.timeout_minutes * 60);
        let started = tokio::time::Instant::now();

        loop {
            // Directly submitted (or cancelled) responses win first.
            if let Some(response) = self.responses.write().await.remove(&request.id) {
                self.record_status(&request.id, &response).await;
                return response;
            }

            // Response channels polled sequentially per tick; the first
            // channel to report wins.
            for channel in &self.response_channels {
                let Some(adapter) = self.adapters.get(channel) else {
                    continue;
                };
                match adapter.poll_response(request).await {
                    Ok(Some(response)) => {
                        self.record_status(&request.id, &response).await;
                        return response;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Approval poll failed");
                    }
                }
            }

            // A zero timeout still performed the poll sweep above.
            if started.elapsed() >= timeout {
                if let Some(pending) = self.pending.write().await.get_mut(&request.id) {
                    pending.status = ApprovalStatus::Timeout;
                }
                return ApprovalResponse::new(&request.id, "timeout")
                    .with_comment("Request timed out");
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn record_status(&self, request_id: &str, response: &ApprovalResponse) {
        let status = match response.decision.as_str() {
            "approve" => ApprovalStatus::Approved,
            "cancelled" => ApprovalStatus::Cancelled,
            "timeout" => ApprovalStatus::Timeout,
            _ => ApprovalStatus::Rejected,
        };
        if let Some(pending) = self.pending.write().await.get_mut(request_id) {
            pending.status = status;
        }
    }

    /// Submit a response for a pending request. Used by adapters and
    /// external surfaces. Idempotent: only the first submission for a
    /// request id takes effect.
    pub async fn submit_response(&self, response: ApprovalResponse) -> bool {
        if !self.pending.read().await.contains_key(&response.request_id) {
            return false;
        }
        let mut responses = self.responses.write().await;
        if responses.contains_key(&response.request_id) {
            return false;
        }
        responses.insert(response.request_id.clone(), response);
        true
    }

    /// Cancel a pending request. The waiting caller observes a synthesized
    /// `cancelled` response at its next poll.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let mut pending = self.pending.write().await;
        let Some(request) = pending.get_mut(request_id) else {
            return false;
        };
        request.status = ApprovalStatus::Cancelled;
        self.responses.write().await.insert(
            request_id.to_string(),
            ApprovalResponse::new(request_id, "cancelled").with_comment("Request was cancelled"),
        );
        true
    }

    /// All currently pending approval requests.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending.read().await.values().cloned().collect()
    }
}
