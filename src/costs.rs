//! Token usage and cost tracking for LLM API calls.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::prelude::*;

/// Token usage for a single API call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: String,

    /// True when the counts were estimated from text length because the
    /// provider response carried no usage block.
    #[serde(default)]
    pub estimated: bool,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The uniform return of every provider-facing call that reports usage.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub token_usage: Option<TokenUsage>,
}

/// A structured completion together with its usage.
#[derive(Debug, Clone)]
pub struct StructuredResult {
    pub value: Value,
    pub token_usage: Option<TokenUsage>,
}

/// USD prices per one million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

/// Conservative default for models missing from the table.
pub const DEFAULT_PRICING: Pricing = Pricing { input: 10.00, output: 30.00 };

/// Static pricing table, per 1M tokens in USD. Approximate; updated
/// periodically alongside the provider model lists.
pub fn model_pricing(model: &str) -> Pricing {
    let price = |input, output| Pricing { input, output };
    match model {
        // OpenAI GPT-5 series
        "gpt-5.2" | "gpt-5.1" | "gpt-5" => price(5.00, 15.00),
        // OpenAI o-series reasoning models
        "o4-mini" | "o3-mini" => price(1.10, 4.40),
        "o3" => price(10.00, 40.00),
        "o1" => price(15.00, 60.00),
        // OpenAI GPT-4 series
        "gpt-4-turbo-preview" | "gpt-4-turbo" | "gpt-4-0125-preview" => price(10.00, 30.00),
        "gpt-4" => price(30.00, 60.00),
        "gpt-4o" => price(2.50, 10.00),
        "gpt-4o-mini" => price(0.15, 0.60),
        "gpt-3.5-turbo" => price(0.50, 1.50),
        // Anthropic
        "claude-sonnet-4-5-20250929" | "claude-sonnet-4-20250514" => price(3.00, 15.00),
        "claude-haiku-4-5-20251001" => price(1.00, 5.00),
        "claude-opus-4-5-20251101" => price(5.00, 25.00),
        "claude-3-5-sonnet-20241022" | "claude-3-5-sonnet-20240620" => price(3.00, 15.00),
        "claude-3-opus-20240229" => price(15.00, 75.00),
        "claude-3-haiku-20240307" => price(0.25, 1.25),
        // Google
        "gemini-1.5-pro" => price(3.50, 10.50),
        "gemini-1.5-flash" => price(0.075, 0.30),
        "gemini-1.0-pro" => price(0.50, 1.50),
        // xAI (estimates)
        "grok-4" | "grok-beta" => price(5.00, 15.00),
        _ => DEFAULT_PRICING,
    }
}

/// Cost of one call in USD. Total pure function of the usage.
pub fn calculate_cost(usage: &TokenUsage) -> f64 {
    let pricing = model_pricing(&usage.model);
    let input_cost = usage.input_tokens as f64 / 1_000_000.0 * pricing.input;
    let output_cost = usage.output_tokens as f64 / 1_000_000.0 * pricing.output;
    input_cost + output_cost
}

/// How many recent usage records the tracker keeps for debugging.
const RECENT_RECORDS_CAP: usize = 100;

#[derive(Debug, Default, Clone, Serialize)]
struct ProviderCosts {
    total_calls: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost: f64,
    cost_by_model: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct CostInner {
    by_provider: BTreeMap<String, ProviderCosts>,
    recent_records: Vec<Value>,
    total_cost: f64,
    total_input_tokens: u64,
    total_output_tokens: u64,
}

/// Thread-safe running totals of API spend across providers and models.
#[derive(Debug, Default)]
pub struct CostTracker {
    inner: Mutex<CostInner>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage and return its cost in USD.
    pub fn record_usage(&self, usage: &TokenUsage) -> f64 {
        let cost = calculate_cost(usage);
        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");

        let provider = inner.by_provider.entry(usage.provider.clone()).or_default();
        provider.total_calls += 1;
        provider.total_input_tokens += usage.input_tokens;
        provider.total_output_tokens += usage.output_tokens;
        provider.total_cost += cost;
        *provider.cost_by_model.entry(usage.model.clone()).or_insert(0.0) += cost;

        inner.total_cost += cost;
        inner.total_input_tokens += usage.input_tokens;
        inner.total_output_tokens += usage.output_tokens;

        if inner.recent_records.len() >= RECENT_RECORDS_CAP {
            inner.recent_records.remove(0);
        }
        inner.recent_records.push(json!({
            "provider": usage.provider,
            "model": usage.model,
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "estimated": usage.estimated,
            "cost": cost,
        }));

        debug!(
            provider = %usage.provider,
            model = %usage.model,
            tokens = usage.total_tokens(),
            cost_usd = cost,
            "recorded API usage"
        );
        cost
    }

    /// Snapshot of totals and per-provider breakdown.
    pub fn summary(&self) -> Value {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        json!({
            "total_cost": inner.total_cost,
            "total_input_tokens": inner.total_input_tokens,
            "total_output_tokens": inner.total_output_tokens,
            "by_provider": &inner.by_provider,
            "recent_records": &inner.recent_records,
        })
    }

    pub fn total_cost(&self) -> f64 {
        self.inner.lock().expect("cost tracker lock poisoned").total_cost
    }
}
