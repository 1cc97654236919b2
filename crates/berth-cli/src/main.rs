//! `berth` entry point.
//!
//! Starts one container, waits until it is ready, prints its endpoints as
//! JSON on stdout and keeps it running until it exits on its own. Ctrl-C
//! at any point runs the shutdown hook, which stops the container and exits
//! with status 130. Logs go to stderr.

mod cli;

use anyhow::Context;
use berth_core::{BerthSettings, CleanupRegistry, LifecycleController};
use berth_engine::DockerEngine;
use clap::Parser;
use cli::{Cli, CliCommand, RunArgs};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries the JSON summary
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("berth=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    berth_core::install_shutdown_hook();
    let settings = BerthSettings::from_env();
    tracing::debug!(?settings, "Settings loaded");

    let mut engine = DockerEngine::connect()
        .context("failed to connect to Docker")?
        .with_stop_grace(settings.stop_grace);
    if let Some(host) = &settings.host_override {
        engine = engine.with_host(host);
    }
    engine.ping().await.context("Docker daemon is not reachable")?;

    let config = args.config(settings)?;
    let mut container = LifecycleController::new(Arc::new(engine), config);

    let handle = match container.start().await {
        Ok(handle) => handle,
        Err(err) => {
            berth_core::teardown().await;
            return Err(err).context("container failed to start");
        }
    };
    println!("{}", serde_json::to_string_pretty(&handle.summary())?);

    // The controller's own hook is skipped when the reaper is disabled.
    let container = Arc::new(container);
    let on_shutdown = container.clone();
    CleanupRegistry::global().register("stop berth run container", move || async move {
        on_shutdown.stop().await
    });

    let err = container.wait_for_unexpected_exit().await;
    tracing::error!(error = %err, "Container is gone");

    berth_core::teardown().await;
    tracing::info!("Shutdown complete");
    Ok(ExitCode::FAILURE)
}
