//! # Health and Metrics Endpoints
//!
//! - `GET /health`: liveness plus model readiness, memory and headline counters
//! - `GET /metrics`: per-endpoint request statistics, transcription outcomes and the
//!   effective configuration
//!
//! Both stay healthy (200) while the model is loading or has failed; readiness is
//! reported in the body, not in the status code.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let model = state.model.status();

    let status = match model.state {
        crate::transcription::ReadinessState::Failed => "degraded",
        _ => "healthy",
    };

    HttpResponse::Ok().json(json!({
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
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_transcriptions": metrics.active_transcriptions
        },
        "memory": get_memory_info(),
        "model": {
            "architecture": config.model.architecture,
            "dir": config.model.dir.display().to_string(),
            "state": model.state,
            "device": model.device,
            "load_time_ms": model.load_time_ms,
            "error": model.error
        },
        "system": get_system_status(&state)
    }))
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

    let transcriptions = &metrics.transcriptions;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "transcriptions": {
            "active": metrics.active_transcriptions,
            "succeeded": transcriptions.succeeded,
            "failed": transcriptions.failed,
            "failures_by_kind": transcriptions.failures_by_kind,
            "audio_seconds": transcriptions.audio_seconds,
            "processing_ms": transcriptions.processing_ms,
            "real_time_factor": transcriptions.real_time_factor()
        },
        "model": state.model.status(),
        "memory": get_memory_info(),
        "config": state.config.summary()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available on {} (pid {})", std::env::consts::OS, process::id())
    })
}

fn get_system_status(state: &AppState) -> serde_json::Value {
    let max = state.config.performance.max_concurrent_transcriptions;
    let in_flight = max.saturating_sub(state.transcriber.available_permits());
    let usage = if max > 0 {
        in_flight as f64 / max as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "saturated"
    } else if usage > 0.5 {
        "busy"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "inference_slots": max,
        "inference_slots_in_use": in_flight,
        "load_warnings": if usage >= 1.0 {
            vec!["All inference slots busy - new uploads will queue"]
        } else {
            vec![]
        }
    })
}
