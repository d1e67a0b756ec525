use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

mod bus;
mod calendar;
mod chat;
mod config;
mod conversation;
mod dispatch;
mod entity;
mod error;
mod kv;
mod llm;
mod server;
mod session;
mod speech;
mod store;
mod vision;
#[cfg(test)]
mod testing;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Lumimei backend starting...");

    let config = config::Config::from_env()?;

    info!("Initializing store at {}", config.database_path.display());
    let store = store::Store::new(&config.database_path).await?;
    store.init().await?;

    info!(
        "LLM endpoint {} ({:?} protocol)",
        config.llm.api_url,
        config.llm.protocol
    );
    let llm = Arc::new(llm::HttpLlmGateway::new(config.llm.clone())?);
    let calendar = Arc::new(calendar::GoogleCalendar::new(
        config.google.clone(),
        Some(store.clone()),
    )?);

    // Speech providers share one connection pool
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let tts = speech::TtsChain::from_config(&config.speech, http.clone());
    let stt = speech::SttChain::from_config(&config.speech, http);
    info!("TTS providers: {:?}", tts.provider_names());
    info!("STT providers: {:?}", stt.provider_names());

    info!("Vision endpoint {} ({})", config.vision.api_url, config.vision.model);
    let vision = Arc::new(vision::LmStudioVision::new(config.vision.clone())?);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let state = Arc::new(server::AppState::new(config, store, llm, calendar, tts, stt, vision));

    let session_sweeper = kv::spawn_sweeper("session", state.sessions.clone(), SWEEP_INTERVAL);
    let job_sweeper = kv::spawn_sweeper("stt job", state.stt_jobs.clone(), SWEEP_INTERVAL);

    let app = server::router(state);
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    session_sweeper.abort();
    job_sweeper.abort();

    Ok(())
}
