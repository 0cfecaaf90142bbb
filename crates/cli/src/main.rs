// tally - reconcile extracted invoices and notes against a ledger export

mod exit_codes;
mod export;
mod input;
mod recon;
mod replay;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use exit_codes::EXIT_SUCCESS;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Reconcile extracted accounting documents against ledger exports")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Log progress to stderr (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match documents against the ledger and report discrepancies
    #[command(after_help = "\
Documents come either pre-extracted (--documents) or as a recording of the
extraction service (--extractions), which runs the full pipeline: page
merging, escalation of unreadable reads, and arbitration of flagged ones.

Exit codes:
  0  everything matched
  3  discrepancies found (flagged documents, missing rows, ledger errors)
  4  invalid config
  5  input could not be loaded

Examples:
  tally verify purchases.recon.toml --ledger journal.csv --documents docs.json
  tally verify purchases.recon.toml --ledger journal.csv --extractions batch.json --json
  tally verify sales.recon.toml --ledger sales.csv --documents docs.json --labels marks.csv")]
    Verify {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Ledger export (.csv, or .json array of rows)
        #[arg(long)]
        ledger: PathBuf,

        /// Pre-extracted documents (JSON array)
        #[arg(long, conflicts_with = "extractions", required_unless_present = "extractions")]
        documents: Option<PathBuf>,

        /// Recorded extraction-service responses to replay
        #[arg(long)]
        extractions: Option<PathBuf>,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write row_index,label CSV for the ledger rows
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Honor the config's pacing delays while replaying
        #[arg(long, requires = "extractions")]
        pace: bool,
    },

    /// Check the ledger's internal consistency (totals, VAT rates, numbering)
    #[command(after_help = "\
Examples:
  tally check-ledger sales.recon.toml --ledger sales.csv
  tally check-ledger sales.recon.toml --ledger sales.csv --json")]
    CheckLedger {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Ledger export (.csv, or .json array of rows)
        #[arg(long)]
        ledger: PathBuf,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,
    },

    /// Validate a recon config without running
    #[command(after_help = "\
Examples:
  tally validate purchases.recon.toml")]
    Validate {
        /// Path to the .recon.toml config file
        config: PathBuf,
    },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("TALLY_COMMIT"), ")",
        "\nengine:  tally-recon ", env!("CARGO_PKG_VERSION"),
        "\ntarget:  ", env!("TALLY_TARGET"),
    )
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "tally=info,tally_recon=info"
    } else {
        "tally=warn,tally_recon=warn"
    };

    // stdout is reserved for --json
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Verify {
            config,
            ledger,
            documents,
            extractions,
            json,
            output,
            labels,
            pace,
        } => {
            recon::cmd_verify(recon::VerifyArgs {
                config,
                ledger,
                documents,
                extractions,
                json,
                output,
                labels,
                pace,
            })
            .await
        }
        Commands::CheckLedger {
            config,
            ledger,
            json,
        } => recon::cmd_check_ledger(config, ledger, json),
        Commands::Validate { config } => recon::cmd_validate(config),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
