//! Acquisition, channel, trigger and streaming configuration.
//!
//! Parameters are loaded from a TOML file with one optional table per
//! category. Configuration problems are non-fatal: a missing file or a
//! missing table falls back to defaults, warned once per category, and
//! execution continues (the device defaults then apply).

use std::path::{Path, PathBuf};

use log::warn;
use serde::Deserialize;

/// Low bits of the acquisition mode encode the number of active channels.
pub const MODE_CHANNEL_MASK: u32 = 0xff;

/// Default streaming transfer buffer size in bytes (2 MiB).
pub const DEFAULT_BUFFER_SIZE_BYTES: usize = 0x20_0000;

// =============================================================================
// Per-category parameter structs
// =============================================================================

/// Acquisition parameters staged into the driver.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Acquisition mode word; low bits select the active channel count.
    pub mode: u32,
    /// Sample rate in Hz.
    pub sample_rate: u64,
    /// Whether an external clock drives sampling.
    pub external_clock: bool,
    /// Sample decimation when running on the external clock.
    pub ext_clock_sample_skip: u32,
    /// Samples per segment, per channel.
    pub segment_size: u64,
    /// Number of segments in the acquisition.
    pub segment_count: u32,
    /// Post-trigger depth in samples.
    pub depth: u64,
    /// ADC resolution (full-scale count).
    pub sample_resolution: u32,
    /// Bits per sample.
    pub sample_bits: u32,
    /// ADC code for zero volts.
    pub sample_offset: i32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: 1,
            sample_rate: 1_000_000_000,
            external_clock: false,
            ext_clock_sample_skip: 0,
            segment_size: 0x20_0000,
            segment_count: 1,
            depth: 0x20_0000,
            sample_resolution: 32_768,
            sample_bits: 16,
            sample_offset: 0,
        }
    }
}

impl AcquisitionConfig {
    /// Number of active channels encoded in the mode word.
    pub fn masked_mode(&self) -> u32 {
        (self.mode & MODE_CHANNEL_MASK).max(1)
    }

    /// Effective sample rate, accounting for external-clock decimation.
    pub fn effective_sample_rate(&self) -> f64 {
        if self.external_clock && self.ext_clock_sample_skip > 0 {
            self.sample_rate as f64 / self.ext_clock_sample_skip as f64 * 1000.0
        } else {
            self.sample_rate as f64
        }
    }
}

/// Parameters for one input channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Full-scale input range in millivolts.
    pub input_range: u32,
    /// DC offset in millivolts.
    pub dc_offset: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            input_range: 2000,
            dc_offset: 0,
        }
    }
}

/// Parameters for one trigger engine. This pipeline configures a single
/// trigger source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Trigger source (1-based channel, or a driver-specific code).
    pub source: i32,
    /// Trigger level as a percentage of full scale.
    pub level: i32,
    /// Trigger slope condition (0 = falling, 1 = rising).
    pub condition: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            source: 1,
            level: 0,
            condition: 1,
        }
    }
}

/// Streaming application parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Transfer timeout in milliseconds; negative disables the timeout.
    pub timeout_on_transfer_ms: i64,
    /// Size of one transfer buffer in bytes.
    pub buffer_size_bytes: usize,
    /// Whether per-buffer analysis is enabled.
    pub do_analysis: bool,
    /// Directory where result files are written.
    pub results_dir: PathBuf,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            timeout_on_transfer_ms: -1,
            buffer_size_bytes: DEFAULT_BUFFER_SIZE_BYTES,
            do_analysis: false,
            results_dir: PathBuf::from("."),
        }
    }
}

impl StreamSettings {
    /// Transfer timeout as an `Option`: `None` waits indefinitely.
    pub fn transfer_timeout(&self) -> Option<u32> {
        if self.timeout_on_transfer_ms < 0 {
            None
        } else {
            Some(self.timeout_on_transfer_ms as u32)
        }
    }
}

// =============================================================================
// Config file
// =============================================================================

/// Raw shape of the configuration file; every table is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    acquisition: Option<AcquisitionConfig>,
    channels: Option<Vec<ChannelConfig>>,
    trigger: Option<TriggerConfig>,
    stream: Option<StreamSettings>,
}

/// Fully resolved configuration with defaults filled in.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Acquisition parameters.
    pub acquisition: AcquisitionConfig,
    /// Per-channel parameters; channels beyond this list use defaults.
    pub channels: Vec<ChannelConfig>,
    /// Single trigger source parameters.
    pub trigger: TriggerConfig,
    /// Streaming application parameters.
    pub stream: StreamSettings,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Never fails: a missing or unparseable file yields full defaults, and
    /// each missing table yields that category's defaults. Each fallback is
    /// warned once.
    pub fn load(path: &Path) -> Config {
        let raw = match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<RawConfig>(&text) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("config file {}: parse error ({}), using defaults", path.display(), e);
                    RawConfig::default()
                }
            },
            Err(_) => {
                warn!("missing config file {}, using defaults", path.display());
                RawConfig::default()
            }
        };
        Config::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Config {
        let acquisition = raw.acquisition.unwrap_or_else(|| {
            warn!("using defaults for acquisition parameters");
            AcquisitionConfig::default()
        });
        let channels = raw.channels.unwrap_or_else(|| {
            warn!("using default parameters for all channels");
            Vec::new()
        });
        let trigger = raw.trigger.unwrap_or_else(|| {
            warn!("using default parameters for trigger");
            TriggerConfig::default()
        });
        let stream = raw.stream.unwrap_or_else(|| {
            warn!("using defaults for stream parameters");
            StreamSettings::default()
        });
        Config {
            acquisition,
            channels,
            trigger,
            stream,
        }
    }

    /// Parameters for the given 1-based channel index, falling back to
    /// defaults past the end of the configured list.
    pub fn channel(&self, index: u32) -> ChannelConfig {
        self.channels
            .get(index.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default()
    }
}

/// Index step between active channels when iterating 1..=channel_count.
///
/// With fewer active channels than physical channels, the driver spreads the
/// active ones evenly across the boards.
pub fn channel_index_increment(masked_mode: u32, channel_count: u32, board_count: u32) -> u32 {
    let channels_per_board = channel_count / board_count.max(1);
    (channels_per_board / masked_mode.max(1)).max(1)
}
