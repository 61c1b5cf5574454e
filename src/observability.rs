use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub frames_processed: u64,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Accumulates per-stage timings for the read/transform/write loop.
/// Cloning shares the underlying snapshot, so the serving thread can
/// observe a run in progress.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_frame(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.frames_processed += 1;
        }
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
}

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
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
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
        frames = snapshot.frames_processed,
        total_duration_ms = snapshot.total_duration_ms,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        debug!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str(
            "# HELP framecast_frames_processed_total Frames pushed through the pipeline\n",
        );
        output.push_str("# TYPE framecast_frames_processed_total counter\n");
        output.push_str(&format!(
            "framecast_frames_processed_total {}\n",
            self.frames_processed
        ));
        output.push_str("# HELP framecast_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE framecast_stage_calls_total counter\n");
        output.push_str(
            "# HELP framecast_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE framecast_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP framecast_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE framecast_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "framecast_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "framecast_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "framecast_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP framecast_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE framecast_pipeline_duration_seconds gauge\n");
        output.push_str(&format!(
            "framecast_pipeline_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timers_accumulate() {
        let collector = MetricsCollector::new();
        for _ in 0..3 {
            let _timer = collector.start_stage("read");
        }
        collector.record_frame();
        collector.record_frame();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.frames_processed, 2);
        assert_eq!(snapshot.stages.get("read").unwrap().calls, 3);
    }

    #[test]
    fn prometheus_rendering_names_stages() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("transform");
        }
        collector.record_frame();
        let prom = collector.snapshot().to_prometheus();
        assert!(prom.contains("framecast_frames_processed_total 1"));
        assert!(prom.contains("framecast_stage_calls_total{stage=\"transform\"}"));
    }
}
