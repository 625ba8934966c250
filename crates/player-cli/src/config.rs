//! Player configuration: optional TOML file plus command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use audio_engine::{EngineConfig, MILLIBEL_MIN};
use serde::Deserialize;

use crate::cli::Args;

/// Settings loaded from the `--config` file.
///
/// ```toml
/// device = "USB"
/// volume_mb = -600
///
/// [engine]
/// low_water_frames = 1024
/// backoff_ms = 20
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Output device substring match.
    pub device: Option<String>,
    /// Initial volume in millibels.
    pub volume_mb: i32,
    pub engine: EngineConfig,
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<PlayerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Config file (if any) with command-line flags applied on top.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut cfg = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(args);
        Ok(cfg)
    }

    fn apply_overrides(&mut self, args: &Args) {
        if let Some(device) = &args.device {
            self.device = Some(device.clone());
        }
        if let Some(frames) = args.low_water_frames {
            self.engine.low_water_frames = frames;
        }
        if let Some(ms) = args.backoff_ms {
            self.engine.backoff_ms = ms;
        }
        if let Some(mb) = args.volume_mb {
            self.volume_mb = mb;
        }
        self.volume_mb = self.volume_mb.clamp(MILLIBEL_MIN, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn file_values_parse_with_defaults() {
        let cfg: PlayerConfig = toml::from_str(
            r#"
            device = "USB"
            [engine]
            backoff_ms = 20
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB"));
        assert_eq!(cfg.volume_mb, 0);
        assert_eq!(cfg.engine.backoff_ms, 20);
        assert_eq!(cfg.engine.low_water_frames, 512);
    }

    #[test]
    fn flags_override_file_and_volume_is_clamped() {
        let mut cfg: PlayerConfig = toml::from_str("volume_mb = -100\n[engine]\nbackoff_ms = 20").unwrap();
        let args = Args::try_parse_from([
            "player-cli",
            "--backoff-ms",
            "5",
            "--volume-mb",
            "300",
            "devices",
        ])
        .unwrap();
        cfg.apply_overrides(&args);
        assert_eq!(cfg.engine.backoff_ms, 5);
        assert_eq!(cfg.volume_mb, 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = PlayerConfig::load(Path::new("/nonexistent/player.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
