//! # Companion Voice Backend - Main Application Entry Point
//!
//! Realtime voice conversation server for a wellness companion app. Clients
//! hold a spoken conversation with an AI counterpart over a websocket: their
//! microphone audio goes to a realtime conversational model, and the model's
//! text is streamed through speech synthesis back to them, with barge-in when
//! the user talks over the agent.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state, metrics, and the conversation core
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics
//! - **audio**: PCM analysis and frame buffering
//! - **conversation**: session store, model and synthesis adapters, orchestrator
//! - **services**: identity, counterpart directory, chat persistence
//! - **websocket**: client socket ↔ orchestrator bridge
//! - **error**: error taxonomy and HTTP error responses

mod audio;
mod config;
mod conversation;
mod error;
mod health;
mod middleware;
mod services;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use conversation::{ConversationOrchestrator, RealtimeModelClient, StateStore, StreamingSynthesisClient};
use services::{FileCounterpartDirectory, JsonlChatStore, JwtIdentityProvider};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM/SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.model.api_key.is_empty() {
        warn!("No conversation model API key configured");
    }
    if config.synthesis.api_key.is_empty() {
        warn!("No speech synthesis API key configured");
    }

    let app_state = build_state(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers()?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            // %U is the path only, so query credentials are never logged
            .wrap(Logger::new("%a \"%U\" %s %b %Dms"))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
            .route(
                "/ws/conversation",
                web::get().to(websocket::conversation_websocket),
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

/// Wire the adapters and collaborators into the shared state.
fn build_state(config: AppConfig) -> Result<AppState> {
    let conversation = config.conversation.clone();

    let store = Arc::new(StateStore::new(conversation.frame_buffer_capacity));
    let model = Arc::new(RealtimeModelClient::new(
        config.model.clone(),
        conversation.session_open_timeout(),
    ));
    let synthesizer = Arc::new(
        StreamingSynthesisClient::new(config.synthesis.clone())
            .context("Failed to build speech synthesis client")?,
    );
    let identity = Arc::new(JwtIdentityProvider::new(
        &config.auth.jwt_secret,
        conversation.default_language.clone(),
    ));
    let directory = Arc::new(
        FileCounterpartDirectory::load(&config.directory.counterparts_path)
            .context("Failed to load counterpart directory")?,
    );
    let chats = Arc::new(JsonlChatStore::new(&config.persistence.chat_log_path));

    let orchestrator = Arc::new(ConversationOrchestrator::new(
        conversation,
        store.clone(),
        model,
        synthesizer,
        identity,
        directory,
        chats,
    ));

    Ok(AppState::new(config, store, orchestrator))
}

/// Console logging filtered by `RUST_LOG`.
///
/// Defaults to `companion_voice_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "companion_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialise tracing")?;

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
    Ok(())
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
