use crate::state::{AppMetrics, AppState};
use crate::transcription::gate::ConcurrencyGate;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let gate = state.pipeline.gate();

    let status = if state.shutdown.is_cancelled() {
        "shutting_down"
    } else {
        "healthy"
    };

    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "jobs_submitted": metrics.jobs.submitted,
            "jobs_succeeded": metrics.jobs.succeeded,
            "jobs_failed": metrics.jobs.failed()
        },
        "memory": get_memory_info(),
        "engine": {
            "executable": state.pipeline.executable().display().to_string(),
            "model": config.engine.model,
            "output_format": config.engine.output_format,
            "converter_enabled": config.converter.enabled
        },
        "pipeline": get_pipeline_status(gate)
    });

    if state.shutdown.is_cancelled() {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let jobs = &metrics.jobs;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "jobs": {
            "submitted": jobs.submitted,
            "succeeded": jobs.succeeded,
            "pending": jobs.pending(),
            "failed": {
                "total": jobs.failed(),
                "process_failed": jobs.process_failed,
                "process_crashed": jobs.process_crashed,
                "empty_output": jobs.empty_output,
                "cancelled": jobs.cancelled
            },
            "average_processing_ms": jobs.average_processing_ms()
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "pipeline": get_pipeline_status(state.pipeline.gate()),
        "performance": {
            "job_timeout_secs": state.get_config().pipeline.job_timeout_secs
        }
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return memory_unavailable("Could not read /proc/self/status"),
    };

    let kib = |key: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };

    json!({
        "resident_memory_bytes": kib("VmRSS:") * 1024,
        "virtual_memory_bytes": kib("VmSize:") * 1024,
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    memory_unavailable("Memory info not available on this platform")
}

fn memory_unavailable(note: &str) -> serde_json::Value {
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": note
    })
}

/// Gate occupancy. Only running engine processes count towards the
/// memory-heavy load; queued jobs are just files on disk.
fn get_pipeline_status(gate: &ConcurrencyGate) -> serde_json::Value {
    let capacity = gate.capacity();
    let in_flight = gate.in_flight();
    let waiting = gate.waiting();

    let status = if in_flight >= capacity && waiting > 0 {
        "saturated"
    } else if in_flight >= capacity {
        "busy"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "max_concurrent_jobs": capacity,
        "in_flight": in_flight,
        "waiting": waiting,
        "load_warnings": if waiting >= capacity {
            vec!["Queue is longer than the pool - consider increasing max_concurrent_jobs"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_pipeline_status_tracks_gate() {
        let gate = ConcurrencyGate::new(1);
        assert_eq!(get_pipeline_status(&gate)["status"], "normal");

        let slot = gate.acquire(&CancellationToken::new()).await.unwrap();
        let status = get_pipeline_status(&gate);
        assert_eq!(status["status"], "busy");
        assert_eq!(status["in_flight"], 1);
        assert_eq!(status["waiting"], 0);

        slot.release();
        assert_eq!(get_pipeline_status(&gate)["in_flight"], 0);
    }
}
