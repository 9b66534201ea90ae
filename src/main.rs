// float_cmp: only in tests where assert_eq! on f64 is intentional.
#![cfg_attr(test, allow(clippy::float_cmp))]

use anyhow::Result;
use ashare_quant_core::app::AppState;
use ashare_quant_core::config::AppConfig;
use ashare_quant_core::http;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

const POOL_SIZE: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    // Local dev convenience only; a real deployment sets these directly.
    // Missing .env is not an error.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load()?;
    let state = AppState::new(config, POOL_SIZE)?;

    state.recover_on_startup().await?;

    let cancel = CancellationToken::new();
    state.spawn_background(cancel.clone());

    let app = http::router(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".into());
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("starting ashare-quant-core HTTP server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await?;

    Ok(())
}
