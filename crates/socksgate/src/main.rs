mod cli;
mod commands;
mod error;

use clap::Parser;
use cli::{Cli, Command};
use error::CliError;
use socksgate_settings::RuntimeSettings;

fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if let Err(e) = dispatch(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run(args) => {
            let config = commands::run::load_config(&args, &cwd)?;
            let runtime = build_runtime(&config.runtime)?;
            runtime.block_on(commands::run::run(args, config))
        }
        Command::Check => {
            let runtime = build_runtime(&RuntimeSettings::default())?;
            runtime.block_on(commands::check::check(cwd))
        }
        Command::Config(args) => commands::config::config(args, cwd),
    }
}

/// Multi-threaded runtime sized from the `[runtime]` section.
fn build_runtime(settings: &RuntimeSettings) -> Result<tokio::runtime::Runtime, CliError> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = settings.worker_threads {
        builder.worker_threads(workers.max(1));
    }
    if let Some(blocking) = settings.blocking_threads {
        builder.max_blocking_threads(blocking.max(1));
    }
    Ok(builder.build()?)
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("SOCKSGATE_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}
