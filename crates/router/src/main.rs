use trestle_router::config::{RouterConfig, StartupError};
use trestle_router::http;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = RouterConfig::load()?;

    // Claim the port before touching the registry or the broker so a bind
    // conflict fails fast.
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|err| StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("failed to bind {}: {}", config.bind_addr, err),
        })?;

    let app = http::router(config.clone()).await?;

    tracing::info!(bind_addr = %config.bind_addr, "trestle-router listening");

    axum::serve(listener, app)
        .await
        .map_err(|err| StartupError {
            code: "ERR_SERVER_FAILED",
            message: err.to_string(),
        })
}
