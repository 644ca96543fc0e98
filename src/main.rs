//! # Voice Relay - Main Application Entry Point
//!
//! HTTP front end for an external speech-to-text engine. Clients upload a
//! voice recording and get the normalized transcript back; the engine runs
//! as a child process behind a bounded job pipeline.
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared application state, metrics and the job pipeline
//! - **transcription**: Engine invocation, concurrency gate, output normalization, cleanup
//! - **health**: Health and metrics endpoints
//! - **middleware**: Custom request processing logic (logging, metrics)
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses
//!
//! ## Shutdown:
//! SIGTERM or SIGINT cancels the shared shutdown token. Every running job
//! holds a child of that token, so engine processes are killed and their
//! files deleted before the server stops.

mod config;        // Configuration management (config.rs)
mod error;         // Error handling types (error.rs)
mod handlers;      // HTTP request handlers (handlers/ directory)
mod health;        // Health check endpoints (health.rs)
mod middleware;    // Custom middleware (middleware/ directory)
mod state;         // Application state management (state.rs)
mod transcription; // Job pipeline (transcription/ directory)

use actix_cors::Cors;
use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{AudioConverter, TranscriptionPipeline};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Sets up logging** for debugging and monitoring
/// 2. **Loads configuration** from files and environment variables
/// 3. **Builds the transcription pipeline** sized by `max_concurrent_jobs`
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        executable = %config.engine.executable,
        model = %config.engine.model,
        max_concurrent_jobs = config.pipeline.max_concurrent_jobs,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let pipeline = build_pipeline(&config);
    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Install before binding so a failure here aborts startup
    watch_for_signals(app_state.shutdown.clone())?;

    info!("Starting HTTP server on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(from_fn(middleware::track_requests))
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/transcriptions", web::post().to(handlers::create_transcription)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);
    let shutdown = app_state.shutdown.clone();

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown.cancelled() => {
            info!(
                in_flight = app_state.pipeline.gate().in_flight(),
                waiting = app_state.pipeline.gate().waiting(),
                "Shutdown signal received, cancelling jobs and stopping server..."
            );
            app_state.pipeline.gate().close();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn build_pipeline(config: &AppConfig) -> TranscriptionPipeline {
    let pipeline = TranscriptionPipeline::new(
        &config.engine.executable,
        config.pipeline.max_concurrent_jobs,
    );

    if config.converter.enabled {
        info!(executable = %config.converter.executable, "Audio conversion enabled");
        pipeline.with_converter(AudioConverter::new(&config.converter.executable))
    } else {
        pipeline
    }
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "voice_relay=trace")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on the first SIGTERM or SIGINT.
///
/// ## Why our own handler:
/// actix's built-in signal handling would stop the server without telling
/// running jobs, leaving engine processes and their files behind. The
/// server is started with `disable_signals()` and stopped from `main`.
fn watch_for_signals(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown.cancel();
    });

    Ok(())
}
