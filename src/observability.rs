use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    /// Executor invocations, retries included.
    pub executions: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_cache_hit(&self, stage: &str) {
        self.update(stage, |metrics| metrics.cache_hits += 1);
    }

    pub fn record_retry(&self, stage: &str) {
        self.update(stage, |metrics| metrics.retries += 1);
    }

    pub fn record_failure(&self, stage: &str) {
        self.update(stage, |metrics| metrics.failures += 1);
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }

    fn update(&self, stage: &str, apply: impl FnOnce(&mut StageMetrics)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(guard.stages.entry(stage.to_string()).or_default());
        }
    }
}

/// Records one executor invocation when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.executions += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            executions = metrics.executions,
            cache_hits = metrics.cache_hits,
            retries = metrics.retries,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn executions(&self, stage: &str) -> u64 {
        self.stages.get(stage).map(|m| m.executions).unwrap_or(0)
    }

    pub fn cache_hits(&self, stage: &str) -> u64 {
        self.stages.get(stage).map(|m| m.cache_hits).unwrap_or(0)
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters: [(&str, &str, fn(&StageMetrics) -> u64); 4] = [
            ("executions", "Stage executor invocations", |m| m.executions),
            ("cache_hits", "Requests answered from the artifact store", |m| m.cache_hits),
            ("retries", "Retried stage executions", |m| m.retries),
            ("failures", "Failed stage invocations", |m| m.failures),
        ];
        for (name, help, read) in counters {
            output.push_str(&format!("# HELP provenant_stage_{name}_total {help}\n"));
            output.push_str(&format!("# TYPE provenant_stage_{name}_total counter\n"));
            for (stage, metrics) in &self.stages {
                output.push_str(&format!(
                    "provenant_stage_{name}_total{{stage=\"{stage}\"}} {}\n",
                    read(metrics)
                ));
            }
        }
        output.push_str(
            "# HELP provenant_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE provenant_stage_duration_seconds_total counter\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "provenant_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP provenant_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE provenant_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "provenant_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
