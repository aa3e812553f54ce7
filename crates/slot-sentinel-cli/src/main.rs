//! Slot Sentinel CLI: entry point.

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use slot_sentinel_cli::commands::{config_cmd, console, simulate, watch};
use slot_sentinel_cli::config::{self, Overrides};
use slot_sentinel_cli::output::EventPrinter;

#[derive(Parser)]
#[command(
    name = "slot-sentinel",
    about = "Slot Sentinel: watch a scheduling page for capacity and claim it",
    version,
    after_help = "Run 'slot-sentinel <command> --help' for details on each command.\nRun 'slot-sentinel' with no command to enter the console."
)]
struct Cli {
    /// Path to a JSON config file.
    #[arg(long, short, global = true, env = "SLOT_SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Print events and summaries as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    /// Arm the engine regardless of the config file.
    #[arg(long, global = true)]
    arm: bool,

    /// Enable auto-click regardless of the config file.
    #[arg(long, global = true)]
    auto_click: bool,

    /// Enable chained confirm regardless of the config file.
    #[arg(long, global = true)]
    chain_confirm: bool,

    /// Base poll interval in milliseconds (minimum 500).
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Preferred days of month, e.g. "3,5,10-12".
    #[arg(long, global = true)]
    days: Option<String>,

    /// Preferred time window, e.g. "9am-12pm".
    #[arg(long, global = true)]
    time: Option<String>,

    /// Monitoring relay base URL.
    #[arg(long, global = true, env = "SLOT_SENTINEL_RELAY")]
    relay_url: Option<String>,

    /// Bearer token for the relay.
    #[arg(long, global = true, env = "SLOT_SENTINEL_TOKEN", hide_env_values = true)]
    relay_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a live status endpoint and run the engine against it.
    Watch {
        /// Status endpoint URL captured from the page.
        #[arg(long)]
        url: String,

        /// HTTP method of the captured request.
        #[arg(long, default_value = "GET")]
        method: String,

        /// Request header as 'Name: value' (repeatable).
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,

        /// Request body.
        #[arg(long)]
        body: Option<String>,

        /// Page script JSON for the page adapter.
        #[arg(long)]
        page: Option<PathBuf>,

        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },

    /// Run a scripted scenario file.
    Simulate {
        /// Scenario JSON file.
        scenario: PathBuf,

        /// Print only the summary.
        #[arg(long, short)]
        quiet: bool,
    },

    /// Interactive console driving an in-process engine.
    Console,

    /// Inspect or create the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   slot-sentinel completions bash > ~/.local/share/bash-completion/completions/slot-sentinel
    ///   slot-sentinel completions zsh > ~/.zfunc/_slot-sentinel
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            armed: self.arm.then_some(true),
            auto_click: self.auto_click.then_some(true),
            chain_confirm: self.chain_confirm.then_some(true),
            poll_interval_ms: self.poll_interval,
            preferred_days: self.days.clone(),
            preferred_time: self.time.clone(),
            relay_url: self.relay_url.clone(),
            relay_token: self.relay_token.clone(),
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let printer = EventPrinter::new(cli.json);
    let explicit = cli.config.clone();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "slot-sentinel", &mut std::io::stdout());
        return Ok(());
    }
    if let Some(Commands::Config {
        action: ConfigAction::Init { force },
    }) = &cli.command
    {
        return config_cmd::init(explicit.as_deref(), *force);
    }

    let file = config::load(explicit.as_deref(), &cli.overrides())?;

    match cli.command {
        None | Some(Commands::Console) => console::run(file, printer).await,
        Some(Commands::Watch {
            url,
            method,
            headers,
            body,
            page,
            timeout,
        }) => {
            let args = watch::WatchArgs {
                url,
                method,
                headers,
                body,
                page,
                timeout_secs: timeout,
            };
            watch::run(file, args, printer).await
        }
        Some(Commands::Simulate { scenario, quiet }) => {
            simulate::run(&scenario, &file, printer, quiet).await
        }
        Some(Commands::Config {
            action: ConfigAction::Show,
        }) => config_cmd::show(&file, explicit.as_deref()),
        Some(Commands::Config {
            action: ConfigAction::Init { .. },
        })
        | Some(Commands::Completions { .. }) => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);
    let json = cli.json;

    let result = dispatch(cli).await;

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if json {
            println!(
                "{}",
                serde_json::json!({ "error": true, "message": format!("{e:#}") })
            );
        } else {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
