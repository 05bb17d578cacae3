use std::path::Path;

use anyhow::{Context, Result};
use landwatch_config::{LandwatchConfig, apply_env_overrides, ensure_config};
use landwatchd::app::App;
use landwatchd::cli::{Cli, Command, LogFormat, parse_cli};
use landwatchd::commands::run_command;
use landwatchd::daemon::run_until_ctrl_c;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_logging(cli.log_format());
    run(cli)
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Human => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.config.as_path();
    let config = load(root)?;

    match cli.command() {
        Command::Daemon => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(async {
                let app = App::build(root, &config)?;
                run_until_ctrl_c(&app, &config).await
            })
        }
        command => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(async {
                let app = App::build(root, &config)?;
                let mut out = std::io::stdout().lock();
                run_command(&app, command, &mut out).await
            })
        }
    }
}

fn load(root: &Path) -> Result<LandwatchConfig> {
    let config = ensure_config(root).with_context(|| {
        format!(
            "failed to load or create config at {}",
            landwatch_config::config_path(root).display()
        )
    })?;
    apply_env_overrides(config, |name| std::env::var(name).ok())
        .context("invalid environment override")
}
