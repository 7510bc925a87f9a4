use log::{error, info};
use std::future::IntoFuture;
use std::sync::Arc;
use tandem_collab::{version_routes, Config, DiagramStore, RelayServer, VersionService};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let config = Config::from_env()?;
    info!("Starting Tandem server...");

    let store = Arc::new(DiagramStore::open(config.store_config())?);
    let versions = Arc::new(VersionService::from_store(store));
    let app = version_routes(versions);

    let relay = RelayServer::new(config.server_config());
    let http = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP API listening on {}", http.local_addr()?);

    tokio::select! {
        result = relay.run() => result?,
        result = axum::serve(http, app).into_future() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
