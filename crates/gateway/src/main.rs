use qgate_gateway::{config, http};

fn exit_with(code: &str, message: impl std::fmt::Display) -> ! {
    eprintln!("STARTUP_ERROR {} {}", code, message);
    std::process::exit(1);
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("qgate-gateway shutting down");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => exit_with(err.code, err.message),
    };
    let bind_addr = config.bind_addr;

    tracing::info!(
        policy_mode = ?config.policy_mode,
        tables = config.schema.tables.len(),
        isolated_tenants = config.tenant_isolation.len(),
        "qgate-gateway configured"
    );

    let app = match http::router(config).await {
        Ok(app) => app,
        Err(err) => exit_with(err.code, err.message),
    };

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(_) => exit_with("ERR_BIND_FAILED", "failed to bind gateway listener"),
    };

    tracing::info!(bind_addr = %bind_addr, "qgate-gateway listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        exit_with("ERR_SERVER_FAILED", err);
    }
}
