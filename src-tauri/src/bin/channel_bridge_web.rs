use std::sync::Arc;

use channel_bridge_lib::config::{Cli, DaemonConfig};
use channel_bridge_lib::rpc::{self, DaemonState};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("channel_bridge_lib=debug,channel_bridge_web=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

async fn serve(config: DaemonConfig) -> Result<(), String> {
    let listen = config.listen;
    let state = Arc::new(DaemonState::load(config).await?);
    let app = rpc::router(Arc::clone(&state));

    info!(
        "channel-bridge-web listening on {listen} (data dir: {})",
        state.config.data_dir.display()
    );

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|err| format!("failed to bind {listen}: {err}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| format!("web server failed: {err}"))?;

    state.host.shutdown().await;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match DaemonConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(serve(config)) {
        error!("{err}");
        std::process::exit(1);
    }
}
