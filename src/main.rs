use shrync::config::AppConfig;
use shrync::error::Result;
use shrync::supervisor::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    info!("starting shrync v{}", config.version);

    let state = AppState::new(config).await?;
    state.startup().await?;

    let addr = format!("0.0.0.0:{}", std::env::var("PORT").unwrap_or_else(|_| "8080".to_string()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    let app = shrync::api::router(state.clone());

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_state.shutdown().await;
        })
        .await?;

    Ok(())
}
