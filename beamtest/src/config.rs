/*!
Run configuration for the beam-test application.

Everything a run needs besides the command line lives here and is stored as
TOML. Command-line flags override the file.
*/

use anyhow::{Context, Result};
use astropix::{AsicSettings, ConfigLayout, FrameLayout, InjectionConfig, VoltageBoardConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Comparator threshold when neither the file nor `-t` sets one
pub const DEFAULT_THRESHOLD_MV: f64 = 100.0;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub run: RunConfig,
    pub connection: ConnectionConfig,
    pub chip: ChipConfig,
    pub asic: AsicSettings,
    pub voltages: VoltageBoardConfig,
    pub injection: InjectionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            connection: ConnectionConfig::default(),
            chip: ChipConfig::default(),
            asic: AsicSettings::default(),
            voltages: VoltageBoardConfig::default().with_threshold_mv(DEFAULT_THRESHOLD_MV),
            injection: InjectionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Output and loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Prefix of every output file name
    pub name: String,

    /// Output directory for logs, CSV and hit maps
    pub outdir: String,

    /// Digital mask file; analog mode when unset
    pub mask: Option<String>,

    pub save_csv: bool,
    pub show_hits: bool,
    pub plot_save: bool,

    /// Log every decoded hit at info level
    pub print_hits: bool,

    /// Stop after this many readouts
    pub max_runs: Option<u64>,

    /// Decode errors tolerated before the run stops
    pub error_max: u64,

    /// Wait between seeing hits and reading them, in milliseconds
    pub settle_ms: u64,

    /// Sleep between polls while no hits are present, in milliseconds
    pub poll_ms: u64,

    /// Sample clock period used for ToT conversion, in nanoseconds
    pub sample_clock_ns: f64,

    /// Writer channel capacity in readouts
    pub channel_buffer_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            outdir: ".".to_string(),
            mask: None,
            save_csv: false,
            show_hits: false,
            plot_save: false,
            print_hits: true,
            max_runs: None,
            error_max: 0,
            settle_ms: 100,
            poll_ms: 1,
            sample_clock_ns: astropix::DEFAULT_SAMPLE_CLOCK_NS,
            channel_buffer_size: 1000,
        }
    }
}

/// How the bridge is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Use the in-process chip emulator instead of hardware
    pub simulate: bool,

    /// Network address of the bridge
    pub address: String,

    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,

    /// Shift-register clock divider
    pub sr_clkdiv: usize,

    /// Bytes clocked out per readout
    pub readout_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            address: "192.168.1.10:7".to_string(),
            connect_timeout_ms: 2000,
            read_timeout_ms: 1000,
            sr_clkdiv: 16,
            readout_bytes: 20,
        }
    }
}

/// Chip revision tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChipConfig {
    /// Configuration layout TOML; the built-in astropix2 table when unset
    pub layout_file: Option<String>,

    /// Built-in frame layout name
    pub frame_layout: String,

    /// Frame layout TOML, takes precedence over `frame_layout`
    pub frame_file: Option<String>,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self { layout_file: None, frame_layout: "astropix2".to_string(), frame_file: None }
    }
}

impl ChipConfig {
    pub fn config_layout(&self) -> Result<ConfigLayout> {
        match &self.layout_file {
            Some(path) => ConfigLayout::load_from_file(path)
                .with_context(|| format!("Failed to load chip layout: {}", path)),
            None => Ok(ConfigLayout::astropix2()),
        }
    }

    pub fn frame_layout(&self) -> Result<FrameLayout> {
        match &self.frame_file {
            Some(path) => FrameLayout::load_from_file(path)
                .with_context(|| format!("Failed to load frame layout: {}", path)),
            None => FrameLayout::by_name(&self.frame_layout)
                .with_context(|| format!("Unknown frame layout: {}", self.frame_layout)),
        }
    }
}
