use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "player-cli", version, about = "Gapless local file player")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML config file; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Buffered frames below which resume waits for the device buffer to refill
    #[arg(long)]
    pub low_water_frames: Option<u64>,

    /// Engine wait when the device buffer is full or the decoder fell behind (ms)
    #[arg(long)]
    pub backoff_ms: Option<u64>,

    /// Output volume in millibels (0 = full, -32768 = silent)
    #[arg(long, allow_negative_numbers = true)]
    pub volume_mb: Option<i32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices
    Devices,

    /// Play files in order, each following file queued for a gapless transition
    Play {
        /// Audio files (anything symphonia can decode)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_overrides() {
        let args = Args::try_parse_from([
            "player-cli",
            "--volume-mb",
            "-600",
            "--backoff-ms",
            "10",
            "play",
            "a.flac",
            "b.flac",
        ])
        .unwrap();
        assert_eq!(args.volume_mb, Some(-600));
        assert_eq!(args.backoff_ms, Some(10));
        match args.cmd {
            Command::Play { paths } => assert_eq!(paths.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn play_requires_a_file() {
        assert!(Args::try_parse_from(["player-cli", "play"]).is_err());
    }
}
