use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stampede::Engine;

#[derive(Parser)]
#[command(name = "stampede")]
#[command(about = "Scripted HTTP load generator driven by JavaScript user journeys")]
#[command(version)]
struct Cli {
    /// Path to the JavaScript scenario file
    #[arg(short, long)]
    script: PathBuf,

    /// Disable the per-stage progress bar
    #[arg(long)]
    no_progress: bool,

    /// Exit with a non-zero status when any threshold fails
    #[arg(long)]
    strict_thresholds: bool,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::info!(script = %cli.script.display(), "loading scenario");
    let engine = Engine::from_script(&cli.script)?;
    let passed = engine.run(!cli.no_progress)?;

    tracing::info!("load test finished");
    if cli.strict_thresholds && !passed {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
