//! Service index, health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /`: service banner.
pub async fn index() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "name": "Verbalaize - Audio Transcription Service",
        "version": env!("CARGO_PKG_VERSION"),
        "message": "Welcome to Verbalaize Audio Transcription API",
        "docs": "/docs",
        "health": "/health"
    }))
}

/// `GET /health` and `GET /api/v1/health`.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let loaded_models = state.engine.cache().loaded_models();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "verbalaize-api",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "device": state.device,
        "sessions": {
            "active": metrics.active_sessions,
            "max": config.realtime.max_concurrent_sessions,
            "opened": metrics.sessions_opened,
            "rejected": metrics.sessions_rejected
        },
        "models": {
            "default": config.models.default_model,
            "loaded": loaded_models
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

/// `GET /api/v1/metrics`: HTTP counters, per-endpoint stats and engine stats.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let engine_stats = state.engine.get_performance_stats().await;

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
        "realtime": {
            "active_sessions": metrics.active_sessions,
            "sessions_opened": metrics.sessions_opened,
            "sessions_rejected": metrics.sessions_rejected
        },
        "transcription": engine_stats,
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let read_kb = |key: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(key))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(config: &crate::config::AppConfig, metrics: &crate::state::AppMetrics) -> serde_json::Value {
    let session_usage =
        metrics.active_sessions as f64 / config.realtime.max_concurrent_sessions.max(1) as f64;

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing realtime.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
