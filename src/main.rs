//! # Persona Voice Backend - Main Application Entry Point
//!
//! Actix-web server fronting a real-time duplex voice relay: browser
//! microphone audio flows in over a persistent WebSocket, generated persona
//! audio flows back on the same connection.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (TOML file + environment variables)
//! - **state**: Shared application state and HTTP metrics
//! - **engine**: Speech model loading, mode selection, per-session inference
//! - **audio**: Amplitude guarding, frame buffering, session management
//! - **websocket**: The per-connection duplex transport loop (`/ws`)
//! - **health / handlers**: REST surface for monitoring and configuration
//! - **middleware**: Request logging and metrics collection
//!
//! ## Startup Sequence:
//! 1. Load and validate configuration
//! 2. Initialize tracing
//! 3. Run the engine capability check (load the model or fall back to mock)
//! 4. Start the HTTP server with the WebSocket route
//! 5. Wait for shutdown signals and stop gracefully

mod audio;      // Amplitude guard, frame buffer, sessions (audio/ directory)
mod config;     // Configuration management (config.rs)
mod device;     // Compute device selection (device.rs)
mod engine;     // Speech model and inference facade (engine/ directory)
mod error;      // Error handling types (error.rs)
mod handlers;   // REST request handlers (handlers/ directory)
mod health;     // Health check endpoints (health.rs)
mod middleware; // Custom middleware (middleware/ directory)
mod state;      // Application state management (state.rs)
mod websocket;  // Duplex WebSocket transport (websocket.rs)

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use engine::EngineRuntime;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task and polled by the
/// main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting persona-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, {} Hz audio, {} sample frames",
        config.server.host, config.server.port, config.audio.sample_rate, config.audio.frame_size
    );

    // One-time capability check: load the model or fall back to mock mode.
    // This never fails; the service must come up either way.
    let engine_runtime = EngineRuntime::initialize(&config).await;
    info!("Engine mode: {}", engine_runtime.mode().as_str());

    let app_state = AppState::new(config.clone(), engine_runtime);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // The duplex voice stream
            .route("/ws", web::get().to(websocket::duplex_websocket))
            // REST surface
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
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
/// `RUST_LOG` controls verbosity; the default keeps this crate at debug and
/// the web framework at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persona_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag is set.
///
/// Simple polling keeps the select loop in main easy to follow; 100ms of
/// shutdown latency is irrelevant next to draining live connections.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
