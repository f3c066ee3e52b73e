use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "socksgate", about = "Local SOCKS5 and HTTP CONNECT proxy")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy and serve until interrupted
    Run(RunArgs),
    /// Check that the proxy can start on this system
    Check,
    /// Manage socksgate configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Interface both listeners bind to
    #[arg(long = "bind", value_name = "HOST")]
    pub bind_host: Option<String>,

    /// SOCKS5 listen port (0 picks a free port)
    #[arg(long, value_name = "PORT")]
    pub socks5_port: Option<u16>,

    /// HTTP CONNECT tunnel listen port (0 picks a free port)
    #[arg(long, value_name = "PORT")]
    pub http_port: Option<u16>,

    /// Do not start the HTTP CONNECT tunnel
    #[arg(long)]
    pub no_http: bool,

    /// Dial a fresh outbound connection for every CONNECT
    #[arg(long)]
    pub no_pool: bool,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore all config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a starter config file
    Init {
        #[arg(long)]
        global: bool,
    },
    /// Print the effective merged configuration
    Show {
        #[arg(long, value_enum, default_value = "toml")]
        format: OutputFormat,
    },
    /// Open config in $EDITOR
    Edit {
        #[arg(long)]
        global: bool,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum OutputFormat {
    Toml,
    Json,
}
