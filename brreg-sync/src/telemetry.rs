use metrics::{counter, histogram};
use std::time::Instant;

pub struct Telemetry;

impl Telemetry {
    pub fn record_request(resource: &str, status: u16) {
        counter!(
            "brreg_requests_total",
            "resource" => resource.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_retry(resource: &str) {
        counter!("brreg_request_retries_total", "resource" => resource.to_string()).increment(1);
    }

    pub fn record_gone(entity_type: &str) {
        counter!("brreg_entities_gone_total", "entity_type" => entity_type.to_string())
            .increment(1);
    }

    pub fn record_applied(entity_type: &str, count: u64) {
        counter!("brreg_entities_applied_total", "entity_type" => entity_type.to_string())
            .increment(count);
    }

    pub fn record_sync_error(entity_type: &str) {
        counter!("brreg_sync_errors_total", "entity_type" => entity_type.to_string()).increment(1);
    }

    pub fn record_job(job: &str, success: bool) {
        counter!(
            "brreg_scheduler_runs_total",
            "job" => job.to_string(),
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
    }

    pub fn record_cache(hit: bool) {
        counter!("brreg_cache_lookups_total", "outcome" => if hit { "hit" } else { "miss" })
            .increment(1);
    }

    pub fn record_latency(operation: &str, duration_ms: f64) {
        histogram!("brreg_operation_duration_ms", "operation" => operation.to_string())
            .record(duration_ms);
    }
}

pub struct OperationTimer {
    start: Instant,
    operation: String
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.to_string()
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed().as_millis() as f64;
        Telemetry::record_latency(&self.operation, duration);
    }
}
