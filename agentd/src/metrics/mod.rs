//! Counters, gauges, and histograms recorded at task transitions and tool
//! calls (spec §4.11). Grounded on the teacher's `LoopMetrics` /
//! `TypeMetrics` / `LoopStats` (`RwLock<HashMap<...>>` + `AtomicU64`
//! aggregates) — no metrics crate appears in any example `Cargo.toml`, so a
//! bespoke registry is the idiomatic choice rather than an omission. All
//! methods are no-ops when `enabled` is false; callers invoke them
//! unconditionally regardless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::tools::ToolName;

#[derive(Debug, Default)]
struct Histogram {
    samples: Vec<f64>,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.samples.push(value);
    }

    fn count(&self) -> u64 {
        self.samples.len() as u64
    }

    fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }
}

/// Lock-free-ish registry (locks are only ever held for the duration of a
/// `HashMap` mutation, never across an await point).
pub struct Metrics {
    enabled: bool,
    started_at: Instant,

    created_total: RwLock<HashMap<String, u64>>,
    grpc_requests_total: RwLock<HashMap<String, u64>>,
    tokens_consumed_total: RwLock<HashMap<String, u64>>,
    cost_total: RwLock<HashMap<String, f64>>,
    sandboxes_created_total: RwLock<HashMap<String, u64>>,
    errors_total: RwLock<HashMap<(String, String), u64>>,

    active_tasks: AtomicI64,
    active_streams: RwLock<HashMap<String, i64>>,
    max_concurrent: AtomicI64,

    task_execution_duration_seconds: RwLock<Histogram>,
    task_queue_wait_duration_seconds: RwLock<Histogram>,
    grpc_request_duration_seconds: RwLock<HashMap<String, Histogram>>,
    task_steps: RwLock<Histogram>,
    task_latency_seconds: RwLock<Histogram>,
}

impl Metrics {
    pub fn new(enabled: bool, max_concurrent: usize) -> Self {
        Self {
            enabled,
            started_at: Instant::now(),
            created_total: RwLock::new(HashMap::new()),
            grpc_requests_total: RwLock::new(HashMap::new()),
            tokens_consumed_total: RwLock::new(HashMap::new()),
            cost_total: RwLock::new(HashMap::new()),
            sandboxes_created_total: RwLock::new(HashMap::new()),
            errors_total: RwLock::new(HashMap::new()),
            active_tasks: AtomicI64::new(0),
            active_streams: RwLock::new(HashMap::new()),
            max_concurrent: AtomicI64::new(max_concurrent as i64),
            task_execution_duration_seconds: RwLock::new(Histogram::default()),
            task_queue_wait_duration_seconds: RwLock::new(Histogram::default()),
            grpc_request_duration_seconds: RwLock::new(HashMap::new()),
            task_steps: RwLock::new(Histogram::default()),
            task_latency_seconds: RwLock::new(Histogram::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    fn bump(map: &RwLock<HashMap<String, u64>>, key: &str) {
        if let Ok(mut m) = map.write() {
            *m.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_task_created(&self, status: &str) {
        if !self.enabled {
            return;
        }
        Self::bump(&self.created_total, status);
    }

    pub fn record_grpc_request(&self, method: &str) {
        if !self.enabled {
            return;
        }
        Self::bump(&self.grpc_requests_total, method);
    }

    pub fn record_tokens(&self, tool: ToolName, input_tokens: u64, output_tokens: u64) {
        if !self.enabled {
            return;
        }
        let _ = tool;
        if let Ok(mut m) = self.tokens_consumed_total.write() {
            *m.entry("input".to_string()).or_insert(0) += input_tokens;
            *m.entry("output".to_string()).or_insert(0) += output_tokens;
        }
    }

    pub fn record_cost(&self, amount_usd: f64) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.cost_total.write() {
            *m.entry("usd".to_string()).or_insert(0.0) += amount_usd;
        }
    }

    pub fn record_sandbox_created(&self, kind: &str) {
        if !self.enabled {
            return;
        }
        Self::bump(&self.sandboxes_created_total, kind);
    }

    pub fn record_error(&self, method: &str, code: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.errors_total.write() {
            *m.entry((method.to_string(), code.to_string())).or_insert(0) += 1;
        }
    }

    pub fn inc_active_tasks(&self) {
        if !self.enabled {
            return;
        }
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_tasks(&self) {
        if !self.enabled {
            return;
        }
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_tasks(&self) -> i64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn inc_active_streams(&self, method: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.active_streams.write() {
            *m.entry(method.to_string()).or_insert(0) += 1;
        }
    }

    pub fn dec_active_streams(&self, method: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.active_streams.write() {
            if let Some(count) = m.get_mut(method) {
                *count -= 1;
            }
        }
    }

    pub fn utilization(&self) -> f64 {
        let max = self.max_concurrent.load(Ordering::Relaxed);
        if max <= 0 {
            return 0.0;
        }
        self.active_tasks() as f64 / max as f64
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn observe_task_execution_duration(&self, d: Duration) {
        if !self.enabled {
            return;
        }
        if let Ok(mut h) = self.task_execution_duration_seconds.write() {
            h.observe(d.as_secs_f64());
        }
    }

    pub fn observe_task_queue_wait_duration(&self, d: Duration) {
        if !self.enabled {
            return;
        }
        if let Ok(mut h) = self.task_queue_wait_duration_seconds.write() {
            h.observe(d.as_secs_f64());
        }
    }

    pub fn observe_grpc_request_duration(&self, method: &str, d: Duration) {
        if !self.enabled {
            return;
        }
        if let Ok(mut m) = self.grpc_request_duration_seconds.write() {
            m.entry(method.to_string()).or_default().observe(d.as_secs_f64());
        }
    }

    pub fn observe_task_steps(&self, steps: u32) {
        if !self.enabled {
            return;
        }
        if let Ok(mut h) = self.task_steps.write() {
            h.observe(steps as f64);
        }
    }

    pub fn observe_task_latency(&self, d: Duration) {
        if !self.enabled {
            return;
        }
        if let Ok(mut h) = self.task_latency_seconds.write() {
            h.observe(d.as_secs_f64());
        }
    }

    /// Snapshot everything as JSON; used by a future scrape/admin surface
    /// (not implemented here, see spec Non-goals).
    pub fn export_json(&self) -> serde_json::Value {
        let histogram_summary = |h: &Histogram| {
            serde_json::json!({ "count": h.count(), "sum": h.sum() })
        };
        serde_json::json!({
            "created_total": self.created_total.read().map(|m| m.clone()).unwrap_or_default(),
            "grpc_requests_total": self.grpc_requests_total.read().map(|m| m.clone()).unwrap_or_default(),
            "tokens_consumed_total": self.tokens_consumed_total.read().map(|m| m.clone()).unwrap_or_default(),
            "cost_total": self.cost_total.read().map(|m| m.clone()).unwrap_or_default(),
            "sandboxes_created_total": self.sandboxes_created_total.read().map(|m| m.clone()).unwrap_or_default(),
            "active_tasks": self.active_tasks(),
            "utilization": self.utilization(),
            "uptime_seconds": self.uptime_seconds(),
            "task_execution_duration_seconds": self.task_execution_duration_seconds.read().map(|h| histogram_summary(&h)).unwrap_or_default(),
            "task_queue_wait_duration_seconds": self.task_queue_wait_duration_seconds.read().map(|h| histogram_summary(&h)).unwrap_or_default(),
            "task_steps": self.task_steps.read().map(|h| histogram_summary(&h)).unwrap_or_default(),
            "task_latency_seconds": self.task_latency_seconds.read().map(|h| histogram_summary(&h)).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_registry_stays_at_zero() {
        let m = Metrics::disabled();
        m.record_task_created("completed");
        m.inc_active_tasks();
        m.observe_task_steps(12);
        assert_eq!(m.active_tasks(), 0);
        assert_eq!(m.created_total.read().unwrap().len(), 0);
    }

    #[test]
    fn enabled_registry_tracks_counters_and_gauges() {
        let m = Metrics::new(true, 5);
        m.record_task_created("completed");
        m.record_task_created("completed");
        m.record_task_created("failed");
        assert_eq!(*m.created_total.read().unwrap().get("completed").unwrap(), 2);

        m.inc_active_tasks();
        m.inc_active_tasks();
        assert_eq!(m.active_tasks(), 2);
        assert!((m.utilization() - 0.4).abs() < 1e-9);

        m.dec_active_tasks();
        assert_eq!(m.active_tasks(), 1);
    }

    #[test]
    fn tokens_and_cost_accumulate() {
        let m = Metrics::new(true, 1);
        m.record_tokens(ToolName::Grounding, 100, 50);
        m.record_tokens(ToolName::Grounding, 10, 5);
        m.record_cost(0.5);
        m.record_cost(0.25);
        assert_eq!(*m.tokens_consumed_total.read().unwrap().get("input").unwrap(), 110);
        assert_eq!(*m.tokens_consumed_total.read().unwrap().get("output").unwrap(), 55);
        assert!((m.cost_total.read().unwrap().get("usd").unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn histograms_record_samples() {
        let m = Metrics::new(true, 1);
        m.observe_task_steps(3);
        m.observe_task_steps(7);
        let json = m.export_json();
        assert_eq!(json["task_steps"]["count"], 2);
        assert_eq!(json["task_steps"]["sum"], 10.0);
    }
}
