//! shelf-enrich: entry point.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use shelf_enrich_cli::cli::{doctor, ip_cmd, run_cmd};
use shelf_enrich_cli::logging;

#[derive(Parser)]
#[command(
    name = "shelf-enrich",
    about = "Enrich a book export CSV with genres and cover images, fetched through Tor",
    version
)]
struct Cli {
    /// JSON config file. Defaults to $SHELF_ENRICH_CONFIG, then ./shelf-enrich.json.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Only log warnings and errors; no progress bar.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich every book in the input CSV and write the result.
    Run(run_cmd::RunArgs),

    /// Print the apparent public IP, optionally rotating first.
    Ip(ip_cmd::IpArgs),

    /// Check that Tor's SOCKS and control ports are usable.
    Doctor,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   shelf-enrich completions bash > ~/.local/share/bash-completion/completions/shelf-enrich
    ///   shelf-enrich completions zsh > ~/.zfunc/_shelf-enrich
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "shelf-enrich", &mut std::io::stdout());
        return Ok(());
    }

    logging::init(&cli.log_level, cli.log_file.as_deref(), cli.quiet)?;

    match cli.command {
        Commands::Run(args) => run_cmd::run(args, cli.config, !cli.quiet).await,
        Commands::Ip(args) => ip_cmd::run(args, cli.config).await,
        Commands::Doctor => doctor::run(cli.config).await,
        Commands::Completions { .. } => Ok(()),
    }
}
