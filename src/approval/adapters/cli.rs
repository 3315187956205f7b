//! Terminal approval adapter.
//!
//! Renders the request in the terminal and collects a decision through an
//! interactive select prompt. The prompt runs on the blocking worker pool;
//! the queue's poll loop picks the decision up on a later tick, so the
//! engine task is never blocked on terminal input.

use async_trait::async_trait;
use console::style;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::approval::{ApprovalRequest, ApprovalResponse};

use super::ApprovalAdapter;

/// CLI-based approval adapter.
pub struct CliAdapter {
    answers: Arc<Mutex<HashMap<String, ApprovalResponse>>>,
}

impl CliAdapter {
    pub fn new() -> Self {
        Self {
            answers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn print_panel(request: &ApprovalRequest) {
        println!();
        println!(
            "{}",
            style("── Approval Required ──────────────────────────").yellow()
        );
        println!("  {}", style(&request.question).bold());
        println!();
        println!("  {} {}", style("Workflow:").dim(), request.workflow_id);
        println!("  {} {}", style("Phase:").dim(), request.phase);
        println!(
            "  {} {} minutes",
            style("Timeout:").dim(),
            request.timeout_minutes
        );
        if !request.context.is_empty() {
            println!("  {}", style("Context:").dim());
            for (key, value) in &request.context {
                println!("    • {}: {}", key, value);
            }
        }
        println!();
    }
}

impl Default for CliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalAdapter for CliAdapter {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send_notification(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        let answers = Arc::clone(&self.answers);
        let request = request.clone();

        // Interactive input happens off the async runtime.
        tokio::task::spawn_blocking(move || {
            Self::print_panel(&request);

            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Your decision")
                .items(&request.options)
                .default(0)
                .interact();

            let decision = match selection {
                Ok(index) => request.options[index].clone(),
                // EOF or interrupt counts as a rejection.
                Err(_) => "reject".to_string(),
            };

            let comment: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Comment (optional)")
                .allow_empty(true)
                .interact_text()
                .unwrap_or_default();

            let mut response = ApprovalResponse::new(&request.id, &decision);
            if !comment.is_empty() {
                response.comment = Some(comment);
            }
            response.responder = Some("cli_user".to_string());
            response.channel = Some("cli".to_string());

            answers
                .lock()
                .expect("cli adapter lock poisoned")
                .insert(request.id.clone(), response);
        });

        Ok(())
    }

    async fn poll_response(
        &self,
        request: &ApprovalRequest,
    ) -> anyhow::Result<Option<ApprovalResponse>> {
        Ok(self
            .answers
            .lock()
            .expect("cli adapter lock poisoned")
            .remove(&request.id))
    }
}
