//! # Audio Transcribe Backend - Main Application Entry Point
//!
//! Actix-web server that turns uploaded audio files into text with a wav2vec2 CTC
//! model.
//!
//! ## Startup sequence:
//! 1. Load `.env`, initialise tracing, load and validate configuration
//! 2. Create the uploads directory
//! 3. Select the compute device and start loading the model in the background
//! 4. Bind the HTTP server immediately; `/status` reports `loading` until the model
//!    is ready and `/upload` answers 503 in the meantime
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment)
//! - **device**: Compute device selection
//! - **audio**: Decoding and canonicalisation to 16 kHz mono
//! - **transcription**: Model, readiness, chunked inference and the upload pipeline
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and per-endpoint metrics
//! - **handlers**: `/status` and `/upload`
//! - **error**: Error taxonomy and HTTP error responses

mod audio; // Audio decoding and resampling (audio/ directory)
mod config; // Configuration management (config.rs)
mod device; // Compute device selection (device.rs)
mod error; // Error handling types (error.rs)
mod handlers; // HTTP request handlers (handlers/ directory)
mod health; // Health check endpoints (health.rs)
mod middleware; // Custom middleware (middleware/ directory)
mod state; // Application state management (state.rs)
mod transcription; // Model and transcription pipeline (transcription/ directory)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{ModelHandle, ModelManager};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    std::fs::create_dir_all(&config.upload.dir).with_context(|| {
        format!(
            "failed to create upload directory {}",
            config.upload.dir.display()
        )
    })?;

    let model = Arc::new(ModelManager::from_preference(&config.model.device));
    info!(
        device = %device::DeviceManager::label(model.device()),
        dir = %config.model.dir.display(),
        architecture = %config.model.architecture,
        "Loading model in the background"
    );
    let model_config = config.model.clone();
    model.start(move |device| ModelHandle::load(&model_config, device));

    let app_state = AppState::new(config.clone(), model);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Middleware executes in reverse order of registration for requests
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/status", web::get().to(handlers::get_status))
                    .route("/upload", web::post().to(handlers::upload_audio)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/status", web::get().to(handlers::get_status))
            .route("/upload", web::post().to(handlers::upload_audio))
    })
    .workers(config.server.workers)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
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

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` controls the filter; without it the default is
/// `audio_transcribe_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_transcribe_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`] on the first one.
///
/// If a handler cannot be installed the server keeps running without graceful
/// shutdown for that signal.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to install SIGINT handler: {}", e);
                None
            }
        };

        if sigterm.is_none() && sigint.is_none() {
            return;
        }

        tokio::select! {
            Some(_) = recv(&mut sigterm) => {
                info!("Received SIGTERM");
            }
            Some(_) = recv(&mut sigint) => {
                info!("Received SIGINT");
            }
            else => return,
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait on an optional signal stream; a missing handler never fires.
async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

/// Poll [`SHUTDOWN_SIGNAL`] every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
