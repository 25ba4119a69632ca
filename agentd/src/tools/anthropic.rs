//! Anthropic-backed [`ToolInvoker`]. Grounded on the teacher's
//! `AnthropicClient` (request/response shape, 429 retry-after handling) but
//! collapsed to the single-call contract spec §4.5 needs: one text(+image)
//! in, one text+usage out, selecting a prompt template per [`ToolName`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LlmConfig;
use crate::metrics::Metrics;

use super::{PromptLoader, RateLimiter, ToolError, ToolErrorKind, ToolInvocation, ToolInvoker, ToolName};

pub struct AnthropicToolInvoker {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    prompts: PromptLoader,
    rate_limiter: RateLimiter,
    metrics: Arc<Metrics>,
}

impl AnthropicToolInvoker {
    pub fn from_config(config: &LlmConfig, metrics: Arc<Metrics>) -> Result<Self, ToolError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ToolError::new(
                ToolErrorKind::InvalidResponse,
                format!("environment variable {} not set", config.api_key_env),
                false,
            )
        })?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ToolError::new(ToolErrorKind::Network, e.to_string(), true))?;
        Ok(Self {
            http,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            max_tokens: config.max_tokens,
            prompts: PromptLoader::default(),
            rate_limiter: RateLimiter::new(20.0, 5.0),
            metrics,
        })
    }

    fn build_body(&self, tool: ToolName, text: &str, image: &Option<Vec<u8>>) -> serde_json::Value {
        let mut ctx = HashMap::new();
        ctx.insert("instruction", text.to_string());
        let system_prompt = self.prompts.render(tool, &ctx);

        let content = match image {
            None => serde_json::json!(text),
            Some(bytes) => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                serde_json::json!([
                    { "type": "text", "text": text },
                    { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": b64 } },
                ])
            }
        };

        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_prompt,
            "messages": [{ "role": "user", "content": content }],
        })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Serialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl ToolInvoker for AnthropicToolInvoker {
    async fn invoke(
        &self,
        tool: ToolName,
        text: &str,
        image: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<ToolInvocation, ToolError> {
        self.rate_limiter.acquire(tool).await;

        let body = self.build_body(tool, text, &image);
        let url = format!("{}/v1/messages", self.base_url);

        let send = self
            .http
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ToolError::new(ToolErrorKind::Timeout, "cancelled", false));
            }
            result = tokio::time::timeout(super::TOOL_CALL_TIMEOUT, send) => {
                result.map_err(|_| ToolError::new(ToolErrorKind::Timeout, "tool call timed out", true))?
                    .map_err(|e| ToolError::new(ToolErrorKind::Network, e.to_string(), true))?
            }
        };

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(ToolError::new(
                ToolErrorKind::RateLimited,
                format!("rate limited, retry after {retry_after}s"),
                true,
            ));
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retryable = status >= 500;
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::new(
                ToolErrorKind::Network,
                format!("anthropic api error {status}: {body}"),
                retryable,
            ));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::InvalidResponse, e.to_string(), false))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| match block {
                AnthropicBlock::Text { text } => Some(text),
                AnthropicBlock::Other => None,
            })
            .unwrap_or_default();

        let cost = token_cost_usd(&self.model, parsed.usage.input_tokens, parsed.usage.output_tokens);
        self.metrics.record_tokens(tool, parsed.usage.input_tokens, parsed.usage.output_tokens);
        self.metrics.record_cost(cost);

        debug!(tool = %tool, input_tokens = parsed.usage.input_tokens, output_tokens = parsed.usage.output_tokens, "AnthropicToolInvoker::invoke");

        Ok(ToolInvocation {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            cost,
        })
    }
}

fn token_cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_price, output_price) = match model {
        m if m.contains("opus") => (15.0, 75.0),
        m if m.contains("haiku") => (0.25, 1.25),
        _ => (3.0, 15.0),
    };
    (input_tokens as f64 / 1_000_000.0) * input_price + (output_tokens as f64 / 1_000_000.0) * output_price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sonnet_pricing_matches_known_rates() {
        let cost = token_cost_usd("claude-sonnet-4", 1_000_000, 100_000);
        assert!((cost - 4.5).abs() < 0.01);
    }

    #[test]
    fn opus_pricing_is_higher_than_sonnet() {
        let opus = token_cost_usd("claude-opus-4", 1_000_000, 0);
        let sonnet = token_cost_usd("claude-sonnet-4", 1_000_000, 0);
        assert!(opus > sonnet);
    }
}
