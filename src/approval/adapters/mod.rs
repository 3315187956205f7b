//! Approval channel adapters.
//!
//! Each adapter binds a channel name to a notification sink and a response
//! source. Adapters are registered on the queue at construction; the queue
//! refers to them purely by channel name (`cli`, `github`, `web`, `slack`).

mod channel;
mod cli;

use async_trait::async_trait;

use crate::approval::{ApprovalRequest, ApprovalResponse};

pub use channel::ChannelAdapter;
pub use cli::CliAdapter;

/// A single approval channel.
#[async_trait]
pub trait ApprovalAdapter: Send + Sync {
    /// Channel name used in configuration (`cli`, `github`, `web`, `slack`).
    fn name(&self) -> &str;

    /// Deliver a notification for a pending request. Errors are logged by
    /// the queue and the request proceeds on the remaining channels.
    async fn send_notification(&self, request: &ApprovalRequest) -> anyhow::Result<()>;

    /// Check for a response to a pending request. Returns `None` when no
    /// response has arrived on this channel yet.
    async fn poll_response(
        &self,
        request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalResponse>>;
}
