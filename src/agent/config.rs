use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::display::DisplayType;

/// Device-local settings. Layered as defaults, then the TOML file, then
/// `HOLOHUB_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub api_base_url: String,
    pub hardware_id: Option<String>,
    pub device_secret: Option<String>,
    pub display_type: DisplayType,
    pub heartbeat_interval_secs: u64,
    pub command_poll_interval_secs: u64,
    pub api_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub max_cache_size_gb: f64,
    pub simulation_mode: bool,
    /// Production display backend, e.g. `"lkg-viewer --fullscreen"`.
    pub viewer_command: Option<String>,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub max_integrity_retries: u32,
    pub firmware_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            api_base_url: "http://localhost:8080".into(),
            hardware_id: None,
            device_secret: None,
            display_type: DisplayType::LookingGlassPortrait,
            heartbeat_interval_secs: 30,
            command_poll_interval_secs: 10,
            api_timeout_secs: 30,
            cache_dir: PathBuf::from("./cache/content"),
            max_cache_size_gb: 10.0,
            simulation_mode: true,
            viewer_command: None,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
            max_integrity_retries: 3,
            firmware_version: "1.0.0".into(),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "agent", about = "HoloHub display agent")]
pub struct AgentCli {
    /// Path to a TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Fleet API base URL
    #[arg(long)]
    pub api_base_url: Option<String>,

    #[arg(long)]
    pub hardware_id: Option<String>,

    #[arg(long)]
    pub device_secret: Option<String>,

    /// looking_glass_portrait, looking_glass_16, looking_glass_32,
    /// looking_glass_65, hypervsn_solo or web_emulator
    #[arg(long)]
    pub display_type: Option<DisplayType>,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Drive a real viewer instead of logging playback
    #[arg(long)]
    pub production: bool,

    #[arg(long)]
    pub viewer_command: Option<String>,
}

impl AgentConfig {
    pub fn load(cli: AgentCli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOLOHUB_API_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("HOLOHUB_HARDWARE_ID") {
            self.hardware_id = Some(v);
        }
        if let Some(v) = lookup("HOLOHUB_DEVICE_SECRET") {
            self.device_secret = Some(v);
        }
        if let Some(v) = lookup("HOLOHUB_VIEWER_COMMAND") {
            self.viewer_command = Some(v);
        }
        if let Some(v) = lookup("HOLOHUB_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOLOHUB_FIRMWARE_VERSION") {
            self.firmware_version = v;
        }
        env_parse(&lookup, "HOLOHUB_DISPLAY_TYPE", &mut self.display_type)?;
        env_parse(&lookup, "HOLOHUB_HEARTBEAT_INTERVAL_SECS", &mut self.heartbeat_interval_secs)?;
        env_parse(&lookup, "HOLOHUB_COMMAND_POLL_INTERVAL_SECS", &mut self.command_poll_interval_secs)?;
        env_parse(&lookup, "HOLOHUB_API_TIMEOUT_SECS", &mut self.api_timeout_secs)?;
        env_parse(&lookup, "HOLOHUB_MAX_CACHE_SIZE_GB", &mut self.max_cache_size_gb)?;
        env_parse(&lookup, "HOLOHUB_SIMULATION_MODE", &mut self.simulation_mode)?;
        env_parse(&lookup, "HOLOHUB_BACKOFF_BASE_SECS", &mut self.backoff_base_secs)?;
        env_parse(&lookup, "HOLOHUB_BACKOFF_MAX_SECS", &mut self.backoff_max_secs)?;
        env_parse(&lookup, "HOLOHUB_MAX_INTEGRITY_RETRIES", &mut self.max_integrity_retries)?;
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: AgentCli) {
        if let Some(v) = cli.api_base_url {
            self.api_base_url = v;
        }
        if cli.hardware_id.is_some() {
            self.hardware_id = cli.hardware_id;
        }
        if cli.device_secret.is_some() {
            self.device_secret = cli.device_secret;
        }
        if let Some(v) = cli.display_type {
            self.display_type = v;
        }
        if let Some(v) = cli.cache_dir {
            self.cache_dir = v;
        }
        if cli.viewer_command.is_some() {
            self.viewer_command = cli.viewer_command;
        }
        if cli.production {
            self.simulation_mode = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if reqwest::Url::parse(&self.api_base_url).is_err() {
            bail!("api_base_url {:?} is not a valid URL", self.api_base_url);
        }
        if self.hardware_id.as_deref().map_or(true, str::is_empty) {
            bail!("hardware_id is required");
        }
        if self.device_secret.as_deref().map_or(true, str::is_empty) {
            bail!("device_secret is required");
        }
        if self.heartbeat_interval_secs == 0
            || self.command_poll_interval_secs == 0
            || self.api_timeout_secs == 0
        {
            bail!("intervals and timeouts must be at least one second");
        }
        if !(self.max_cache_size_gb > 0.0) {
            bail!("max_cache_size_gb must be positive");
        }
        if !self.simulation_mode && self.viewer_command.is_none() {
            bail!("viewer_command is required outside simulation mode");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Longest pause between retries. Never longer than a heartbeat
    /// interval, so an offline agent still re-syncs on the usual cadence.
    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs).min(self.heartbeat_interval())
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_secs(self.command_poll_interval_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn max_cache_bytes(&self) -> u64 {
        (self.max_cache_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

fn env_parse<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}"))?;
    }
    Ok(())
}
