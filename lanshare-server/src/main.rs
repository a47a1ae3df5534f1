use std::net::SocketAddr;

use clap::Parser;
use lanshare_server::{
    AppState, ServerArgs, ServerConfig, local_ip, serve_with_shutdown, spawn_expiry_sweeper,
    startup_banner,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let mut config = ServerConfig::from(&args);
    if let Ok(addr) = listener.local_addr() {
        config.port = addr.port();
    }

    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(err) => {
            error!("failed to initialize server state: {}", err);
            std::process::exit(1);
        }
    };

    let sweeper = spawn_expiry_sweeper(state.clone());

    let url = format!("http://{}", SocketAddr::new(local_ip(), state.config().port));
    info!(%url, upload_dir = %state.config().upload_dir.display(), "server starting");
    match startup_banner(&url, !args.no_qr) {
        Ok(banner) => println!("{banner}"),
        Err(err) => warn!("cannot render startup banner: {}", err),
    }

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };

    if let Err(err) = serve_with_shutdown(listener, state, shutdown).await {
        warn!("server exited: {}", err);
    }
    sweeper.abort();
}
