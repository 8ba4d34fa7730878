use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

use crate::campaign::CampaignSettings;
use crate::classifier::{Block, BLOCK_SIZE};
use crate::engine::{Edge, Polarity};
use crate::error::GlitchError;
use crate::hardware::bench::BenchConfig;
use crate::units::{ClockParameters, GlitchParameters, DEFAULT_CLOCK_MHZ, DEFAULT_MIN_DELAY_OFFSET_NS};

/// Parse a 16 byte hex string, optional `0x` prefix
pub fn parse_block(s: &str) -> Result<Block, String> {
    let cleaned = s.strip_prefix("0x").unwrap_or(s);
    if cleaned.len() != 2 * BLOCK_SIZE || !cleaned.is_ascii() {
        return Err(format!(
            "Invalid block '{}': expected {} hex digits",
            s,
            2 * BLOCK_SIZE
        ));
    }
    let mut block = [0u8; BLOCK_SIZE];
    for (index, byte) in block.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&cleaned[2 * index..2 * index + 2], 16)
            .map_err(|e| format!("Invalid block '{}': {}", s, e))?;
    }
    Ok(block)
}

/// Custom deserializer for key and plaintext blocks given as hex strings
pub fn deserialize_block<'de, D>(deserializer: D) -> Result<Block, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    let text: String = Deserialize::deserialize(deserializer)?;
    parse_block(&text).map_err(de::Error::custom)
}

/// Configuration structure that can be loaded from JSON5
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
    #[serde(default = "Config::default_clock_mhz")]
    pub clock_mhz: f64,
    #[serde(default = "Config::default_min_delay_offset_ns")]
    pub min_delay_offset_ns: f64,
    #[serde(default = "Config::default_trigger_edge")]
    pub trigger_edge: Edge,
    #[serde(default = "Config::default_output_polarity")]
    pub output_polarity: Polarity,
    #[serde(default)]
    pub details: bool,
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub bench: BenchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            clock_mhz: Self::default_clock_mhz(),
            min_delay_offset_ns: Self::default_min_delay_offset_ns(),
            trigger_edge: Self::default_trigger_edge(),
            output_polarity: Self::default_output_polarity(),
            details: false,
            campaign: CampaignSettings::default(),
            bench: BenchConfig::default(),
        }
    }
}

impl Config {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_clock_mhz() -> f64 {
        DEFAULT_CLOCK_MHZ
    }

    fn default_min_delay_offset_ns() -> f64 {
        DEFAULT_MIN_DELAY_OFFSET_NS
    }

    fn default_trigger_edge() -> Edge {
        Edge::Rising
    }

    fn default_output_polarity() -> Polarity {
        Polarity::ActiveHigh
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, GlitchError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GlitchError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json5(&content)
    }

    pub fn from_json5(content: &str) -> Result<Self, GlitchError> {
        json5::from_str(content)
            .map_err(|e| GlitchError::Config(format!("Failed to parse JSON5 config: {}", e)))
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Options only override when given on the command line
        if let Some(value) = args.min_delay {
            self.campaign.min_delay_ns = value;
        }
        if let Some(value) = args.max_delay {
            self.campaign.max_delay_ns = value;
        }
        if let Some(value) = args.min_length {
            self.campaign.min_length_ns = value;
        }
        if let Some(value) = args.max_length {
            self.campaign.max_length_ns = value;
        }
        if let Some(value) = args.repeats {
            self.campaign.repeats = value;
        }
        if args.seed.is_some() {
            self.campaign.seed = args.seed;
        }
        if let Some(edge) = args.edge {
            self.trigger_edge = edge;
        }
        if let Some(polarity) = args.polarity {
            self.output_polarity = polarity;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }

        // Flags only override when set
        if args.no_progress {
            self.campaign.progress = false;
        }
        if args.details {
            self.details = true;
        }
    }

    pub fn clock(&self) -> Result<ClockParameters, GlitchError> {
        ClockParameters::from_frequency_mhz(self.clock_mhz, self.min_delay_offset_ns)
    }

    /// Startup glitch parameters: default timing with the configured edge and polarity.
    pub fn glitch_parameters(&self) -> GlitchParameters {
        let mut params = GlitchParameters::default();
        params.input_trigger_edge = self.trigger_edge;
        params.output_polarity = self.output_polarity;
        params
    }

    pub fn campaign_settings(&self) -> &CampaignSettings {
        &self.campaign
    }
}

/// Command-line arguments of the glitcher.
///
/// Every option is optional and overrides the matching value of the JSON5 file.
///
/// # Fields
///
/// * `config` - Load configuration from JSON5 file.
/// * `min_delay` / `max_delay` - Trigger delay search range in ns.
/// * `min_length` / `max_length` - Pulse width search range in ns.
/// * `repeats` - Attempts including the golden capture.
/// * `seed` - Seed for the parameter draws.
/// * `edge` - Trigger edge: rising or falling.
/// * `polarity` - Glitch pulse polarity: high or low.
/// * `details` - Print the whole fault corpus.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Minimum trigger delay in ns
    #[arg(long)]
    pub min_delay: Option<f64>,

    /// Maximum trigger delay in ns
    #[arg(long)]
    pub max_delay: Option<f64>,

    /// Minimum glitch length in ns
    #[arg(long)]
    pub min_length: Option<f64>,

    /// Maximum glitch length in ns
    #[arg(long)]
    pub max_length: Option<f64>,

    /// Number of attempts including the golden capture
    #[arg(short, long)]
    pub repeats: Option<u64>,

    /// Seed for the random parameter search
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Trigger edge: rising or falling
    #[arg(short, long)]
    pub edge: Option<Edge>,

    /// Glitch pulse polarity: high or low
    #[arg(short, long)]
    pub polarity: Option<Polarity>,

    /// Log level used when RUST_LOG is not set
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Hide the progress bar
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,

    /// Print every fault record
    #[arg(short, long, default_value_t = false)]
    pub details: bool,
}
