use std::io::{self, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use ets_bridge::cli::Cli;
use ets_bridge::config::BridgeConfig;
use ets_bridge::engine::Engine;
use ets_bridge::events::Emitter;
use ets_bridge::orchestrator::{SessionConfig, TestSession};
use ets_bridge::paths;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ets_bridge=info",
        1 => "ets_bridge=debug",
        _ => "ets_bridge=trace",
    };
    // stdout carries the record stream; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let parameters = cli.test_parameters()?;

    let (config, config_path) = match &cli.config {
        Some(path) => (BridgeConfig::load_file(path)?, Some(path.clone())),
        None => {
            let cwd = std::env::current_dir()
                .context("failed to get current directory (was it deleted?)")?;
            BridgeConfig::load(&cwd)?
        }
    };
    match config_path {
        Some(ref p) => info!("loaded config from {}", p.display()),
        None => info!("no .ets-bridge/config.toml found, using defaults"),
    }

    let install_dir = paths::resolve_install_dir(config.engine.install_dir.as_deref())?;
    let mut session_config = SessionConfig::new(
        &cli.port,
        &cli.profile,
        &cli.test_case,
        parameters,
        &config,
        install_dir,
    );
    if cli.teardown_on_failure {
        session_config.teardown_on_failure = true;
    }
    debug!(
        install_dir = %session_config.install_dir.display(),
        encoding = config.output.encoding.label(),
        "engine settings"
    );
    if !session_config.verify_credential {
        warn!("dongle verification failures will be ignored");
    }

    let engine = open_engine(&config)?;
    let emitter = Arc::new(Emitter::stdout());
    let input = BufReader::new(io::stdin());
    let mut session = TestSession::new(session_config, emitter, input);

    let report = session
        .run(engine.as_ref())
        .with_context(|| format!("test case {} did not complete", cli.test_case))?;
    info!(
        address = %report.dongle_address,
        verdict = ?report.verdict,
        "session complete"
    );
    Ok(())
}

#[cfg(windows)]
fn open_engine(config: &BridgeConfig) -> Result<Box<dyn Engine>> {
    Ok(Box::new(ets_bridge::engine::ets_manager::EtsManager::new(
        config.output.encoding,
    )))
}

#[cfg(not(windows))]
fn open_engine(_config: &BridgeConfig) -> Result<Box<dyn Engine>> {
    anyhow::bail!("the test engine is only available on Windows")
}
