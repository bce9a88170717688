// =============================================================================
// Meridian Engine — Main Entry Point
// =============================================================================
//
// Loads config/state/history from disk, wires the exchange, price-stream,
// and advisory adapters, then hands a single `Arc<Engine>` to both the
// scheduler loop and the REST API server.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod advisory;
mod api;
mod config;
mod engine;
mod exchange;
mod indicators;
mod lifecycle;
mod logging;
mod market_data;
mod position;
mod price_stream;
mod risk;
mod scheduler;
mod state_store;
mod strategy;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::advisory::HttpAdvisoryClient;
use crate::config::Config;
use crate::engine::{Engine, EnginePaths};
use crate::exchange::BinanceFuturesClient;
use crate::logging::LogBuffer;
use crate::price_stream::BinanceMarkPriceStream;
use crate::scheduler::Scheduler;
use crate::state_store::{State, TradeHistory};

fn data_dir() -> PathBuf {
    std::env::var("MERIDIAN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let log_buffer = LogBuffer::new();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(log_buffer.clone())
        .with(env_filter)
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                Meridian Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Load persisted config/state/history ──────────────────────────
    let dir = data_dir();
    let paths = EnginePaths {
        config: dir.join("config.json"),
        state: dir.join("state.json"),
        history: dir.join("history.json"),
    };

    let config = Config::load(&paths.config);
    let state = State::load(&paths.state);
    let history = TradeHistory::load(&paths.history);

    info!(symbols = ?config.symbols, "configured trading symbols");

    // ── 2. Build adapters ─────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let exchange: Arc<dyn exchange::ExchangeAdapter> = Arc::new(BinanceFuturesClient::new(api_key, api_secret));

    let advisory_endpoint = std::env::var("ADVISORY_ENDPOINT").unwrap_or_else(|_| "https://localhost/advisory".into());
    let advisory_api_key = std::env::var("ADVISORY_API_KEY").ok();
    let advisory: Arc<dyn advisory::AdvisoryAdapter> = Arc::new(HttpAdvisoryClient::new(advisory_endpoint, advisory_api_key));

    let price_stream = Arc::new(BinanceMarkPriceStream::new());
    let price_stream_dyn: Arc<dyn price_stream::PriceStreamAdapter> = price_stream.clone();

    // ── 3. Build the engine ───────────────────────────────────────────────
    let symbols: Vec<String> = config.symbols.iter().cloned().collect();
    let engine = Arc::new(Engine::new(
        exchange,
        advisory,
        price_stream_dyn,
        config,
        state,
        history,
        paths,
        log_buffer,
    ));

    // ── 4. Spawn the price stream ─────────────────────────────────────────
    {
        let stream = price_stream.clone();
        let symbols = symbols.clone();
        tokio::spawn(async move {
            let callback: price_stream::PriceCallback = Arc::new(|_, _, _| {});
            stream.run(symbols, callback).await;
        });
    }
    info!(count = symbols.len(), "price stream launched");

    // ── 5. Start the scheduler ────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(engine.clone()));
    scheduler.clone().start();

    // ── 6. Start the API server ───────────────────────────────────────────
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::rest::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "API server exited with error");
        }
    });

    // ── 7. Await shutdown ─────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler.stop();
    price_stream.disconnect();
    server.abort();

    info!("shutdown complete");
    Ok(())
}
