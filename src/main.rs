use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};

use shellbridge::config::{Config, DEFAULT_BIND, DEFAULT_SHELL};
use shellbridge::session::local::{self, LocalOptions};

/// Run a command through the configured shell, the way a remote session
/// would, with this terminal as the client.
#[derive(Parser, Debug)]
#[command(name = "shellbridge", version, about)]
struct Cli {
    /// Working directory for launched programs
    #[arg(long, env = "SHELLBRIDGE_CHDIR")]
    chdir: Option<PathBuf>,

    /// Do not pass this process's environment to launched programs
    #[arg(long, env = "SHELLBRIDGE_NO_ENV")]
    no_env: bool,

    /// Extra KEY=VALUE for launched programs (repeatable)
    #[arg(long = "env", short = 'e', value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Listen address for the remote transport
    #[arg(long, env = "SHELLBRIDGE_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Shell that wraps every command
    #[arg(long, env = "SHELLBRIDGE_SHELL", default_value = DEFAULT_SHELL)]
    shell: String,

    /// How long output may keep draining after the program exits
    #[arg(long, env = "SHELLBRIDGE_WAIT_DELAY_MS", default_value_t = 500)]
    wait_delay_ms: u64,

    /// Never allocate a pseudo-terminal
    #[arg(long)]
    no_pty: bool,

    #[arg(long, env = "SHELLBRIDGE_LOG", default_value_t = Level::WARN)]
    log_level: Level,

    /// Command to run; empty starts the shell itself
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let config = Config {
            chdir: self.chdir.clone(),
            no_env: self.no_env,
            env: self.env.clone(),
            bind: self.bind.clone(),
            shell: self.shell.clone(),
            wait_delay: Duration::from_millis(self.wait_delay_ms),
        };
        config.validated().context("invalid configuration")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(cli.log_level)
        .init();

    let config = Arc::new(cli.config()?);
    info!("🚀 Starting shellbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration: {:?}", config);

    let outcome = local::run(
        config,
        LocalOptions {
            command: cli.command.join(" "),
            force_pipes: cli.no_pty,
        },
    )
    .await;
    if let Some(message) = &outcome.message {
        info!("{}", message);
    }

    std::process::exit(outcome.code);
}
