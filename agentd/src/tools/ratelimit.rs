//! Per-tool rate limiting (spec §4.5): a token bucket per [`super::ToolName`],
//! adapted from the teacher coordinator's sliding-window `RateLimiter`
//! (`HashMap<key, VecDeque<Instant>>`) to bucket/refill semantics. On
//! exhaustion the caller sleeps for the refill interval rather than erroring
//! (spec: "sleep the caller").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use super::ToolName;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct Config {
    capacity: f64,
    refill_per_second: f64,
}

/// One token bucket per [`ToolName`], each refilling at its own configured
/// rate. Tools with no explicit config get an effectively unlimited bucket.
pub struct RateLimiter {
    buckets: Mutex<HashMap<&'static str, Bucket>>,
    configs: HashMap<&'static str, Config>,
    default_capacity: f64,
    default_refill_per_second: f64,
}

impl RateLimiter {
    pub fn new(default_capacity: f64, default_refill_per_second: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            configs: HashMap::new(),
            default_capacity,
            default_refill_per_second,
        }
    }

    pub fn with_tool_limit(mut self, tool: ToolName, capacity: f64, refill_per_second: f64) -> Self {
        self.configs.insert(tool.as_str(), Config { capacity, refill_per_second });
        self
    }

    fn config_for(&self, tool: ToolName) -> (f64, f64) {
        self.configs
            .get(tool.as_str())
            .map(|c| (c.capacity, c.refill_per_second))
            .unwrap_or((self.default_capacity, self.default_refill_per_second))
    }

    /// Consume one token for `tool`, sleeping the caller until one is
    /// available if the bucket is currently empty.
    pub async fn acquire(&self, tool: ToolName) {
        let (capacity, refill_per_second) = self.config_for(tool);
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let bucket = buckets.entry(tool.as_str()).or_insert_with(|| Bucket {
                    tokens: capacity,
                    last_refill: Instant::now(),
                });

                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / refill_per_second.max(0.0001)))
                }
            };

            match wait {
                None => return,
                Some(duration) => {
                    debug!(tool = %tool, ?duration, "RateLimiter::acquire: sleeping for refill");
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_within_capacity() {
        let limiter = RateLimiter::new(5.0, 1.0);
        for _ in 0..5 {
            limiter.acquire(ToolName::Grounding).await;
        }
    }

    #[tokio::test]
    async fn per_tool_buckets_are_independent() {
        let limiter = RateLimiter::new(1.0, 1000.0);
        limiter.acquire(ToolName::Grounding).await;
        // A different tool's bucket is untouched by Grounding's draw.
        limiter.acquire(ToolName::Evaluator).await;
    }

    #[tokio::test]
    async fn tool_specific_override_applies() {
        let limiter = RateLimiter::new(100.0, 100.0).with_tool_limit(ToolName::WebSearch, 1.0, 1000.0);
        limiter.acquire(ToolName::WebSearch).await;
        // Second immediate draw would have to wait on the 1-capacity
        // bucket, but the fast refill rate (1000/s) means it returns
        // almost instantly rather than hanging the test.
        limiter.acquire(ToolName::WebSearch).await;
    }
}
