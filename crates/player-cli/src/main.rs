//! Gapless local file player.
//!
//! Decodes files with Symphonia on background threads and hands 16-bit PCM to the
//! `audio-engine` output thread. Each following file is queued as the engine's next source
//! so that tracks with the same sample rate play back to back without a gap.

mod cli;
mod config;
mod runtime;
mod source;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info,player_cli=info")
        }))
        .init();
    let cfg = config::PlayerConfig::from_args(&args)?;
    tracing::debug!(?cfg, "configuration");

    match args.cmd {
        cli::Command::Devices => runtime::devices(),
        cli::Command::Play { paths } => runtime::play(&cfg, paths),
    }
}
