//! Output device discovery and selection.
//!
//! Thin wrappers around cpal for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config that runs at exactly the source's sample rate

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Pick an output config running at exactly `rate`.
///
/// Among the ranges that contain `rate`, prefers more channels up to stereo, then the
/// better sample format. Fails when no range supports the rate; gapless output does no
/// resampling.
pub fn pick_output_config(device: &cpal::Device, rate: u32) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(u8, u8, cpal::SupportedStreamConfigRange)> = None;
    for range in ranges {
        if rate < range.min_sample_rate() || rate > range.max_sample_rate() {
            continue;
        }
        let channel_rank = channel_rank(range.channels());
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_channels, b_format, _)) => {
                is_better_candidate(channel_rank, format_rank, *b_channels, *b_format)
            }
        };
        if replace {
            best = Some((channel_rank, format_rank, range));
        }
    }

    best.map(|(_, _, range)| range.with_sample_rate(rate))
        .ok_or_else(|| anyhow!("Output device does not support {rate} Hz"))
}

/// Stream buffer size for a device buffer of `wanted_frames`.
///
/// Clamps into the advertised range; `None` lets cpal use its default.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    wanted_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let upper = (*max).min(MAX_FRAMES).max(*min);
            Some(cpal::BufferSize::Fixed(wanted_frames.clamp(*min, upper)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Smallest callback period the device's default config advertises.
pub fn default_period_frames(device: &cpal::Device) -> Option<u32> {
    let config = device.default_output_config().ok()?;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, .. } if *min > 0 => Some(*min),
        _ => None,
    }
}

fn channel_rank(channels: u16) -> u8 {
    match channels {
        2 => 0,
        1 => 1,
        _ => 2,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(channels: u8, format: u8, best_channels: u8, best_format: u8) -> bool {
    if channels != best_channels {
        channels < best_channels
    } else {
        format < best_format
    }
}

/// Output device metadata for the device listing.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub is_default: bool,
}

/// Describe every output device of `host`.
///
/// Devices whose config query fails are still listed, without a rate range.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let devices = host.output_devices().context("No output devices")?;

    let mut out = Vec::new();
    for d in devices {
        let name = d.description()?.name().to_string();
        let (mut min_rate, mut max_rate) = (u32::MAX, 0u32);
        match d.supported_output_configs() {
            Ok(ranges) => {
                for r in ranges {
                    min_rate = min_rate.min(r.min_sample_rate());
                    max_rate = max_rate.max(r.max_sample_rate());
                }
            }
            Err(err) => tracing::debug!(device = %name, error = %err, "config query failed"),
        }
        if min_rate > max_rate {
            (min_rate, max_rate) = (0, 0);
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
