use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Resilient SSH SOCKS tunnel supervisor")]
pub struct Config {
    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Path to the settings file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the profile store
    #[arg(short = 's', long)]
    pub profile_store: Option<PathBuf>,

    /// Local TCP port for the SOCKS listener
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Daemon settings (from config file)
///
/// Timeouts and thresholds drifted across revisions of the original setup,
/// so all of them are tunable here rather than baked in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Local TCP port the SOCKS listener binds
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// How long to wait for a recognizable response after spawning ssh
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Delay between reconnect attempts after a transient failure
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Time between liveness probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// How long a probe waits for the prompt to reappear;
    /// should stay shorter than the probe interval
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes tolerated before the tunnel is replaced
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Profile store location (defaults to ~/.vps-proxy)
    #[serde(default)]
    pub profile_store: Option<PathBuf>,
}

fn default_local_port() -> u16 {
    8088
}

fn default_connect_timeout() -> u64 {
    20_000
}

fn default_retry_delay() -> u64 {
    10_000
}

fn default_probe_interval() -> u64 {
    6_000
}

fn default_probe_timeout() -> u64 {
    3_000
}

fn default_failure_threshold() -> u32 {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            connect_timeout_ms: default_connect_timeout(),
            retry_delay_ms: default_retry_delay(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            profile_store: None,
        }
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {:?}", p))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", p));
            }
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("vps-proxy/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/vps-proxy/config.toml")),
            dirs::home_dir().map(|p| p.join(".vps-proxy.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", path));
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(port) = cli.port {
            self.local_port = port;
        }
        if let Some(store) = &cli.profile_store {
            self.profile_store = Some(store.clone());
        }
    }

    /// Validate and normalize settings values
    ///
    /// Clamps intervals and timeouts to a minimum so a mistyped config
    /// cannot turn the daemon into a busy loop.
    pub fn validate(&mut self) {
        const MIN_INTERVAL_MS: u64 = 100;

        if self.connect_timeout_ms < MIN_INTERVAL_MS {
            self.connect_timeout_ms = MIN_INTERVAL_MS;
        }
        if self.retry_delay_ms < MIN_INTERVAL_MS {
            self.retry_delay_ms = MIN_INTERVAL_MS;
        }
        if self.probe_interval_ms < MIN_INTERVAL_MS {
            self.probe_interval_ms = MIN_INTERVAL_MS;
        }
        if self.probe_timeout_ms < MIN_INTERVAL_MS {
            self.probe_timeout_ms = MIN_INTERVAL_MS;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Resolved profile store path.
    pub fn store_path(&self) -> PathBuf {
        self.profile_store
            .clone()
            .unwrap_or_else(super::profile::default_store_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.local_port, 8088);
        assert_eq!(settings.connect_timeout_ms, 20_000);
        assert_eq!(settings.retry_delay_ms, 10_000);
        assert_eq!(settings.probe_interval_ms, 6_000);
        assert_eq!(settings.probe_timeout_ms, 3_000);
        assert_eq!(settings.failure_threshold, 2);
        assert!(settings.profile_store.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            local_port = 1080
            probe_interval_ms = 10000
            failure_threshold = 3
        "#;

        let settings: Settings = toml::from_str(toml).expect("Should parse TOML");
        assert_eq!(settings.local_port, 1080);
        assert_eq!(settings.probe_interval_ms, 10_000);
        assert_eq!(settings.failure_threshold, 3);
        // Unspecified fields keep their defaults.
        assert_eq!(settings.retry_delay_ms, 10_000);
    }

    #[test]
    fn test_merge_cli() {
        let mut settings = Settings::default();
        let cli = Config {
            debug: false,
            config: None,
            profile_store: Some(PathBuf::from("/tmp/store")),
            port: Some(9999),
        };
        settings.merge_cli(&cli);
        assert_eq!(settings.local_port, 9999);
        assert_eq!(settings.profile_store, Some(PathBuf::from("/tmp/store")));
    }

    #[test]
    fn test_validate_clamps_intervals() {
        let mut settings = Settings {
            probe_interval_ms: 0,
            probe_timeout_ms: 1,
            ..Settings::default()
        };
        settings.validate();
        assert_eq!(settings.probe_interval_ms, 100);
        assert_eq!(settings.probe_timeout_ms, 100);
    }

    #[test]
    fn test_store_path_override() {
        let settings = Settings {
            profile_store: Some(PathBuf::from("/etc/vps-proxy/profiles")),
            ..Settings::default()
        };
        assert_eq!(settings.store_path(), PathBuf::from("/etc/vps-proxy/profiles"));
    }
}
