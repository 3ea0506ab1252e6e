use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;

use gitops_squared::config::{Cli, ServerConfig};
use gitops_squared::http::{HttpServer, ServerState};
use gitops_squared::{build_catalog, restore_or_warn, telemetry};

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.log_format);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "gitops-squared failed");
            ExitCode::FAILURE
        }
    }
}

// The registry client is blocking, so the catalog is built and restored
// before the async runtime exists.
fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = ServerConfig::from_cli(cli)?;
    tracing::info!(
        registry = %config.store.registry_host,
        prefix = %config.store.repo_prefix,
        namespace = %config.default_namespace,
        registry_timeout = %humantime::format_duration(config.store.timeout),
        request_timeout = %humantime::format_duration(config.request_timeout),
        "loaded configuration"
    );

    let catalog = Arc::new(build_catalog(&config)?);
    restore_or_warn(&catalog);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let state = ServerState::new(
        Arc::clone(&catalog),
        config.default_namespace.as_str(),
        config.request_timeout,
    );
    let server = HttpServer::new(config.listen_addr, state);
    runtime.block_on(server.serve(async {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
        }
    }))
}
