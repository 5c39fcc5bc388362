//! 🚀 ixl-cli: the front door.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! Loads config, sets up logging, runs one ingest session, prints the receipt.
//! Like a manager. 🦆
//!
//! Exit codes: `0` clean run, `1` the run could not happen, `2` the run happened but
//! recorded failures (so the alias stayed where it was).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// 📦 Index lifecycle and bulk ingestion for Elasticsearch-style backends.
#[derive(Debug, Parser)]
#[command(name = "ixl", version, about)]
struct Cli {
    /// 🔧 TOML config file. Missing file means "env vars only" (IXL_*).
    #[arg(default_value = "ixl.toml")]
    config: PathBuf,

    /// 🩹 Incremental run into the existing index; nothing is created or deleted.
    #[arg(long)]
    update: bool,

    /// 🗑️ Drop and recreate the target index before writing.
    #[arg(long)]
    delete_index: bool,

    /// 🙈 Leave the alias alone at the end, whatever happens.
    #[arg(long)]
    no_switch: bool,

    /// 🤫 No progress bar.
    #[arg(long)]
    no_progress: bool,
}

async fn run_cli(cli: Cli) -> Result<ixl::session::RunSummary> {
    // 🔒 Validate the config file exists before we get too emotionally attached
    let config_file = match cli.config.try_exists().with_context(|| {
        format!(
            "💀 could not check whether '{}' exists. Relative paths resolve against the working directory.",
            cli.config.display()
        )
    })? {
        true => Some(cli.config.as_path()),
        false => {
            warn!("🔧 '{}' not found; using IXL_* environment variables only", cli.config.display());
            None
        }
    };

    let mut app_config = ixl::app_config::load_config(config_file)
        .context("💀 In ixl-cli, main, we couldn't load the config. Check the file and the IXL_* variables.")?;

    // -- 🎛️ command-line flags only ever switch things on
    app_config.index.update |= cli.update;
    app_config.index.delete |= cli.delete_index;
    if cli.no_switch {
        app_config.runtime.switch_alias = false;
    }
    if cli.no_progress {
        app_config.runtime.progress = false;
    }

    ixl::run(app_config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run_cli(cli).await {
        Ok(summary) => {
            println!("{}", ixl::progress::summary_table(&summary));
            if summary.failed {
                error!(
                    "💀 {} item(s) failed; the alias was not switched",
                    summary.counters.failed
                );
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: Elasticsearch does not seem reachable. Check the url in [backend.Elasticsearch], \
                    and whether the cluster is actually up (`docker ps`, `curl <url>/_cluster/health`)."
                );
            }
            ExitCode::from(1)
        }
    }
}
