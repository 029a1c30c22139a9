use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use proxy_core::{ProxyConfig, Server};
use tracing::error;

#[derive(Parser)]
#[command(name = "proxy")]
struct Args {
    #[arg(short = 'c', long = "config", default_value = "config/proxy.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match ProxyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to initialize server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown_server.shutdown();
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "accept loop terminated with an error");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown_signal() {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
