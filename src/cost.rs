//! Token-cost tracking with threshold-gated budget enforcement.
//!
//! Every LLM call records a usage event; the running total is classified
//! against the budget thresholds and the classification is returned as a
//! value rather than raised, so the engine decides how to act: warn and
//! continue, route an approval request, or terminate the workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::config::CostSettings;

/// Flat fallback rate (USD per 1M combined tokens) for models missing from
/// the pricing table.
const FALLBACK_RATE_PER_MTOK: f64 = 5.0;

/// Pricing for a model, in USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_price: f64,
    pub output_price: f64,
}

impl ModelPricing {
    pub fn new(input_price: f64, output_price: f64) -> Self {
        Self {
            input_price,
            output_price,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_price
            + (output_tokens as f64 / 1_000_000.0) * self.output_price
    }
}

/// Default pricing for common models.
pub fn default_pricing() -> BTreeMap<String, ModelPricing> {
    let mut pricing = BTreeMap::new();
    pricing.insert(
        "claude-opus-4-20250514".to_string(),
        ModelPricing::new(15.0, 75.0),
    );
    pricing.insert(
        "claude-sonnet-4-20250514".to_string(),
        ModelPricing::new(3.0, 15.0),
    );
    pricing.insert(
        "claude-3-5-haiku-20241022".to_string(),
        ModelPricing::new(0.25, 1.25),
    );
    pricing.insert("gpt-4o".to_string(), ModelPricing::new(2.5, 10.0));
    pricing.insert("gpt-4o-mini".to_string(), ModelPricing::new(0.15, 0.60));
    pricing
}

/// A single usage event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Classification of the running total against the budget thresholds.
/// Returned by `add_usage`; the engine acts on it after each LLM call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetStatus {
    /// Below the warning threshold (or budget disabled).
    Ok,
    /// At or above the warning threshold; the engine logs and continues.
    Warning { spent: f64, limit: f64 },
    /// At or above the approval threshold and not yet approved; the engine
    /// must route through the approval queue.
    ApprovalRequired { spent: f64, limit: f64 },
    /// At or above the hard limit; the engine must terminate the workflow.
    Exceeded { spent: f64, limit: f64 },
}

/// Cost summary with per-model and per-phase breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub by_model: BTreeMap<String, f64>,
    pub by_phase: BTreeMap<String, f64>,
    pub events_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_percent_used: Option<f64>,
}

#[derive(Debug, Default)]
struct Totals {
    events: Vec<UsageEvent>,
    total_cost_usd: f64,
    total_tokens: u64,
    budget_approved: bool,
}

/// Tracks and classifies token costs for one workflow.
pub struct CostTracker {
    workflow_id: String,
    settings: CostSettings,
    pricing: BTreeMap<String, ModelPricing>,
    totals: Mutex<Totals>,
}

impl CostTracker {
    pub fn new(workflow_id: &str, settings: CostSettings) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            settings,
            pricing: default_pricing(),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn with_pricing(mut self, pricing: BTreeMap<String, ModelPricing>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Record a usage event and classify the new running total.
    pub fn add_usage(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        phase: Option<&str>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> (UsageEvent, BudgetStatus) {
        let cost = match self.pricing.get(model) {
            Some(pricing) => pricing.calculate_cost(input_tokens, output_tokens),
            None => {
                ((input_tokens + output_tokens) as f64 / 1_000_000.0) * FALLBACK_RATE_PER_MTOK
            }
        };

        let event = UsageEvent {
            timestamp: Utc::now(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd: cost,
            phase: phase.map(|p| p.to_string()),
            metadata: metadata.unwrap_or_default(),
        };

        let mut totals = self.totals.lock().expect("cost tracker lock poisoned");
        totals.events.push(event.clone());
        totals.total_cost_usd += cost;
        totals.total_tokens += input_tokens + output_tokens;

        let status = self.classify(&totals);
        (event, status)
    }

    fn classify(&self, totals: &Totals) -> BudgetStatus {
        let limit = self.settings.budget_limit_usd;
        if limit <= 0.0 {
            return BudgetStatus::Ok;
        }

        let spent = totals.total_cost_usd;
        let used = spent / limit;

        if used >= 1.0 {
            BudgetStatus::Exceeded { spent, limit }
        } else if used >= self.settings.require_approval_at && !totals.budget_approved {
            BudgetStatus::ApprovalRequired { spent, limit }
        } else if used >= self.settings.warning_threshold {
            BudgetStatus::Warning { spent, limit }
        } else {
            BudgetStatus::Ok
        }
    }

    /// Current classification without recording a new event.
    pub fn status(&self) -> BudgetStatus {
        let totals = self.totals.lock().expect("cost tracker lock poisoned");
        self.classify(&totals)
    }

    /// Approve continuing past the approval threshold. Subsequent usage no
    /// longer re-prompts until the hard limit.
    pub fn approve_budget(&self) {
        self.totals
            .lock()
            .expect("cost tracker lock poisoned")
            .budget_approved = true;
    }

    pub fn is_budget_approved(&self) -> bool {
        self.totals
            .lock()
            .expect("cost tracker lock poisoned")
            .budget_approved
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.totals
            .lock()
            .expect("cost tracker lock poisoned")
            .total_cost_usd
    }

    pub fn total_tokens(&self) -> u64 {
        self.totals
            .lock()
            .expect("cost tracker lock poisoned")
            .total_tokens
    }

    pub fn budget_limit_usd(&self) -> f64 {
        self.settings.budget_limit_usd
    }

    /// Aggregate totals plus per-model and per-phase breakdowns.
    pub fn get_summary(&self) -> CostSummary {
        let totals = self.totals.lock().expect("cost tracker lock poisoned");

        let mut by_model: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_phase: BTreeMap<String, f64> = BTreeMap::new();
        let mut total_input = 0u64;
        let mut total_output = 0u64;

        for event in &totals.events {
            *by_model.entry(event.model.clone()).or_default() += event.cost_usd;
            if let Some(phase) = &event.phase {
                *by_phase.entry(phase.clone()).or_default() += event.cost_usd;
            }
            total_input += event.input_tokens;
            total_output += event.output_tokens;
        }

        let (budget_remaining, budget_percent_used) = if self.settings.budget_limit_usd > 0.0 {
            (
                Some(self.settings.budget_limit_usd - totals.total_cost_usd),
                Some(totals.total_cost_usd / self.settings.budget_limit_usd * 100.0),
            )
        } else {
            (None, None)
        };

        CostSummary {
            total_tokens: totals.total_tokens,
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            total_cost_usd: totals.total_cost_usd,
            by_model,
            by_phase,
            events_count: totals.events.len(),
            budget_remaining,
            budget_percent_used,
        }
    }
}
