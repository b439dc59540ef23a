use apollo_gateway::error::AppError;
use axum::http::StatusCode;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,apollo_gateway=debug")
            }),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, "gateway exited: {}", err.message);
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &'static str) -> impl FnOnce(String) -> AppError {
    move |message| AppError::new(StatusCode::BAD_REQUEST, code, message)
}

async fn run() -> Result<(), AppError> {
    let state = apollo_gateway::app::load_state().await?;
    let addr: std::net::SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| startup_error("listen_invalid")(err.to_string()))?;
    let app = apollo_gateway::app::build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed")(err.to_string()))?;
    tracing::info!(%addr, "apollo gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|err| startup_error("serve_failed")(err.to_string()))
}
