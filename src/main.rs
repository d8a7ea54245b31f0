//! # Verbalaize Backend - Main Application Entry Point
//!
//! Realtime and file-upload speech transcription over Actix-web.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared application state, metrics and session slots
//! - **transcription**: model cache, Whisper backend and transcription engine
//! - **audio**: chunk buffering and the per-connection session state machine
//! - **websocket**: actor that speaks the realtime protocol
//! - **handlers**: upload, model status and runtime config endpoints
//! - **health**: service banner, health and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **error**: HTTP error type and JSON error responses
//!
//! ## Startup:
//! 1. Load `.env`, set up tracing
//! 2. Load and validate configuration
//! 3. Pick the compute device and build the (empty) model cache
//! 4. Serve until SIGINT/SIGTERM, then stop gracefully

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use device::{device_label, select_device, DevicePreference};
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::whisper::WhisperLoader;
use transcription::{ModelCache, TranscriptionEngine};

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting verbalaize-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let preference: DevicePreference = config
        .models
        .device
        .parse()
        .map_err(anyhow::Error::msg)?;
    let device = select_device(preference);
    let device_name = device_label(&device);

    // Models load lazily on first use; nothing is downloaded here.
    let loader = WhisperLoader {
        device,
        cache_dir: config.models.cache_dir.as_ref().map(PathBuf::from),
        hf_token: std::env::var("HF_TOKEN").ok(),
        ffmpeg_path: config.models.ffmpeg_path.clone(),
    };
    let cache = Arc::new(ModelCache::new(Arc::new(loader)));
    let engine = Arc::new(TranscriptionEngine::new(
        cache,
        config.models.language_hint.clone(),
    ));
    info!(
        default_model = %config.models.default_model,
        "Model cache ready, models load on first request"
    );

    let app_state = AppState::new(config.clone(), engine, device_name);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(build_cors(&cors_origins))
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(health::index))
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/v1/transcribe")
                    .route("/realtime", web::get().to(websocket::realtime_websocket))
                    .route("/upload", web::post().to(handlers::transcribe_upload)),
            )
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/transcribe/realtime", web::get().to(websocket::realtime_websocket))
                    .route("/transcribe/upload", web::post().to(handlers::transcribe_upload)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Set up `tracing` with `RUST_LOG`, defaulting to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "verbalaize_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Any origin unless `server.cors_origins` lists specific ones.
fn build_cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(3600);

    if origins.is_empty() {
        cors.allow_any_origin()
    } else {
        origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
