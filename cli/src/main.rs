use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use dbg_bridge_cli::defaults_cmd;
use dbg_bridge_cli::defaults_cmd::DefaultsCli;
use dbg_bridge_cli::load_config;
use dbg_bridge_cli::session_cmd;
use dbg_bridge_cli::session_cmd::AttachCli;
use dbg_bridge_cli::session_cmd::LaunchCli;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dbg_bridge=info,dbg_bridge_core=info,dbg_bridge_cli=info";

/// Drive an interactive debugger through a persistent subprocess.
///
/// Debugger output goes to stdout; logs and asynchronous events go to
/// stderr.
#[derive(Debug, Parser)]
#[command(name = "dbg-bridge", version)]
struct Cli {
    /// Path to a config.toml; defaults to $DBG_BRIDGE_HOME/config.toml.
    #[arg(long = "config", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Attach to a running process and enter the command loop.
    Attach(AttachCli),

    /// Launch an executable under the debugger and enter the command loop.
    Launch(LaunchCli),

    /// Print the shared default target selections.
    Defaults(DefaultsCli),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Attach(attach) => session_cmd::run_attach(attach, config).await,
        Command::Launch(launch) => session_cmd::run_launch(launch, config).await,
        Command::Defaults(defaults) => defaults_cmd::run(defaults, &config),
    }
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
