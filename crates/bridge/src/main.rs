use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tc_bridge::bot::Bridge;
use tc_domain::Config;

#[derive(Parser)]
#[command(
    name = "teleclaude",
    about = "Bridge one Telegram chat to a local Claude Code agent",
    version
)]
struct Cli {
    /// Working directory for the agent (overrides WORK_DIR).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Render tool results into the chat (overrides VERBOSE).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::from_env();
    if let Some(work_dir) = cli.work_dir {
        config.work_dir = work_dir;
    }
    if cli.verbose {
        config.verbose = true;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("error: {error}");
        }
        eprintln!("\nRequired environment: BOT_TOKEN, CHAT_ID");
        std::process::exit(1);
    }

    tracing::info!(work_dir = %config.work_dir.display(), "teleclaude starting");
    Arc::new(Bridge::new(config)).run().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tc_bridge=debug")),
        )
        .init();
}
