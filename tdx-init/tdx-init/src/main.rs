mod config;

use anyhow::{Context, Result, bail};
use tdx_setup::{Orchestrator, is_cancelled};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Setup,
    Validate,
    GenerateConfig,
}

const USAGE: &str = "usage: tdx-init [setup|validate|generate-config] [path]";
const EXAMPLE_FILE: &str = "config.example.toml";

fn parse_args(args: &[String]) -> Result<(Mode, Option<&str>)> {
    let (mode, rest) = match args.first().map(String::as_str) {
        Some("setup") => (Mode::Setup, &args[1..]),
        Some("validate") => (Mode::Validate, &args[1..]),
        Some("generate-config") => (Mode::GenerateConfig, &args[1..]),
        Some("-h" | "--help" | "help") => bail!(USAGE),
        _ => (Mode::Setup, args),
    };
    match rest {
        [] => Ok((mode, None)),
        [path] => Ok((mode, Some(path.as_str()))),
        _ => bail!(USAGE),
    }
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    log::info!("received shutdown signal, cancelling");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, path) = parse_args(&args)?;

    if mode == Mode::GenerateConfig {
        let target = path.unwrap_or(EXAMPLE_FILE);
        std::fs::write(target, tdx_setup::config::EXAMPLE)
            .with_context(|| format!("failed to write example config to {target}"))?;
        println!("Example configuration written to {target}");
        return Ok(());
    }

    let path = config::resolve_path(path);
    let config = config::load(&path)?;
    log::info!("loaded configuration from {}", path.display());

    if mode == Mode::Validate {
        let rendered =
            toml::to_string_pretty(&config).context("failed to render configuration")?;
        println!("Configuration is valid!\n\nParsed configuration:\n{rendered}");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut orchestrator = Orchestrator::new(config)?;
    if let Err(e) = orchestrator.run(&cancel).await {
        if is_cancelled(&e) {
            log::warn!("setup cancelled before completion");
        }
        return Err(e);
    }
    Ok(())
}
