//! # ASR Backend - Transcription Server
//!
//! Actix-web server exposing speech recognition over HTTP.
//!
//! ## Startup sequence:
//! 1. **Load configuration** from defaults, `config.toml`, `.env` and the environment
//! 2. **Set up logging**
//! 3. **Load the acoustic model** once; every request shares it
//! 4. **Serve** `/health`, `/ping`, `/metrics` and `POST /asr`
//! 5. **Shut down gracefully** on SIGINT / SIGTERM

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;

use asr_backend::config::AppConfig;
use asr_backend::device::{device_from_setting, DeviceManager};
use asr_backend::state::AppState;
use asr_backend::transcription::{TranscriptionEngine, TranscriptionService, Wav2Vec2Ctc};
use asr_backend::{handlers, health, init_tracing, middleware};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("asr_backend=debug,actix_web=info");

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting asr-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}", config.bind_addr());

    let device = device_from_setting(&config.model.device);
    info!("Inference device: {}", DeviceManager::describe(&device));

    // Fail fast: a server without a model cannot answer anything useful
    let model = Wav2Vec2Ctc::load(&config.model, device).await?;
    let engine = TranscriptionEngine::new(Arc::new(model), &config.performance);
    let service = TranscriptionService::new(Arc::new(engine), &config.audio);

    let bind_addr = config.bind_addr();
    let app_state = AppState::new(config, Arc::new(service));

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
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/health", web::get().to(health::ping))
            .route("/ping", web::get().to(health::ping))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/asr", web::post().to(handlers::transcribe))
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
