//! Programmable in-process adapter.
//!
//! Backs the API surface (external callers push decisions in) and the test
//! suite. The adapter can be configured to answer every request with a
//! fixed decision, to stay silent, or to fail notification delivery.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::approval::{ApprovalRequest, ApprovalResponse};

use super::ApprovalAdapter;

#[derive(Default)]
struct Inner {
    queued: HashMap<String, ApprovalResponse>,
    last_notified: Option<ApprovalRequest>,
}

/// In-process channel adapter with programmable behavior.
pub struct ChannelAdapter {
    name: String,
    auto_decision: Option<String>,
    fail_notifications: bool,
    inner: Mutex<Inner>,
}

impl ChannelAdapter {
    /// An adapter that answers every request with `decision`.
    pub fn auto(name: &str, decision: &str) -> Self {
        Self {
            name: name.to_string(),
            auto_decision: Some(decision.to_string()),
            fail_notifications: false,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// An adapter that receives notifications but never responds.
    pub fn silent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            auto_decision: None,
            fail_notifications: false,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// An adapter whose notification delivery always fails.
    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            auto_decision: None,
            fail_notifications: true,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queue a response for a specific request id.
    pub fn push_response(&self, response: ApprovalResponse) {
        let mut inner = self.inner.lock().expect("channel adapter lock poisoned");
        inner.queued.insert(response.request_id.clone(), response);
    }

    /// The most recent request delivered to this adapter.
    pub fn last_notified(&self) -> Option<ApprovalRequest> {
        self.inner
            .lock()
            .expect("channel adapter lock poisoned")
            .last_notified
            .clone()
    }
}

#[async_trait]
impl ApprovalAdapter for ChannelAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_notification(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        if self.fail_notifications {
            anyhow::bail!("channel '{}' is unreachable", self.name);
        }

        let mut inner = self.inner.lock().expect("channel adapter lock poisoned");
        inner.last_notified = Some(request.clone());

        if let Some(decision) = &self.auto_decision {
            let mut response = ApprovalResponse::new(&request.id, decision);
            response.responder = Some(format!("{}_user", self.name));
            response.channel = Some(self.name.clone());
            inner.queued.insert(request.id.clone(), response);
        }
        Ok(())
    }

    async fn poll_response(
        &self,
        request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalResponse>> {
        let mut inner = self.inner.lock().expect("channel adapter lock poisoned");
        Ok(inner.queued.remove(&request.id))
    }
}
