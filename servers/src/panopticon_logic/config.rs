use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_panopticon::PanopticonSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "panopticon.json";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Panopticon live-data tap", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PANOPTICON_CONFIG", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PANOPTICON_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PANOPTICON_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PANOPTICON_LOG_BACKUPS", help = "Number of older log files to keep.")]
    pub backup_count: Option<usize>,

    #[clap(long, env = "PANOPTICON_CHANNELS", help = "Comma-separated channels to tap.")]
    pub channels: Option<String>,

    #[clap(long, env = "PANOPTICON_BATCH_INTERVAL_MS", help = "Dispatcher flush interval in milliseconds.")]
    pub batch_interval_ms: Option<u64>,

    #[clap(long, env = "LIGHTHOUSE_URI", help = "Lighthouse WebSocket URI.")]
    pub lighthouse_uri: Option<String>,

    #[clap(long, env = "LIGHTHOUSE_MAX_CAN_FRAMES", help = "CAN frames kept in the can_frames window.")]
    pub max_can_frames: Option<usize>,

    #[clap(long, env = "LIGHTHOUSE_RECONNECT_MAX_DELAY_MS", help = "Upper bound of the reconnect backoff in milliseconds.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "REDIS_MAIN_HOST", help = "Main Redis host.")]
    pub redis_main_host: Option<String>,

    #[clap(long, env = "REDIS_MAIN_PORT", help = "Main Redis port.")]
    pub redis_main_port: Option<u16>,

    #[clap(long, env = "REDIS_MAIN_DB", help = "Main Redis database index.")]
    pub redis_main_db: Option<i64>,

    #[clap(long, env = "REDIS_MAIN_USERNAME", help = "Main Redis username.")]
    pub redis_main_username: Option<String>,

    #[clap(long, env = "REDIS_MAIN_PASSWORD", hide_env_values = true, help = "Main Redis password.")]
    pub redis_main_password: Option<String>,

    #[clap(long, env = "REDIS_HEALTH_HOST", help = "Health Redis host.")]
    pub redis_health_host: Option<String>,

    #[clap(long, env = "REDIS_HEALTH_PORT", help = "Health Redis port.")]
    pub redis_health_port: Option<u16>,

    #[clap(long, env = "REDIS_HEALTH_DB", help = "Health Redis database index.")]
    pub redis_health_db: Option<i64>,

    #[clap(long, env = "REDIS_HEALTH_USERNAME", help = "Health Redis username.")]
    pub redis_health_username: Option<String>,

    #[clap(long, env = "REDIS_HEALTH_PASSWORD", hide_env_values = true, help = "Health Redis password.")]
    pub redis_health_password: Option<String>,

    /// Full library settings; only read from the config file.
    #[clap(skip)]
    pub settings: Option<PanopticonSettings>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            backup_count: other.backup_count.or(self.backup_count),
            channels: other.channels.or(self.channels),
            batch_interval_ms: other.batch_interval_ms.or(self.batch_interval_ms),
            lighthouse_uri: other.lighthouse_uri.or(self.lighthouse_uri),
            max_can_frames: other.max_can_frames.or(self.max_can_frames),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            redis_main_host: other.redis_main_host.or(self.redis_main_host),
            redis_main_port: other.redis_main_port.or(self.redis_main_port),
            redis_main_db: other.redis_main_db.or(self.redis_main_db),
            redis_main_username: other.redis_main_username.or(self.redis_main_username),
            redis_main_password: other.redis_main_password.or(self.redis_main_password),
            redis_health_host: other.redis_health_host.or(self.redis_health_host),
            redis_health_port: other.redis_health_port.or(self.redis_health_port),
            redis_health_db: other.redis_health_db.or(self.redis_health_db),
            redis_health_username: other.redis_health_username.or(self.redis_health_username),
            redis_health_password: other.redis_health_password.or(self.redis_health_password),
            settings: other.settings.or(self.settings),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("/tmp/panopticon/logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn backup_count(&self) -> usize {
        self.backup_count.unwrap_or(5)
    }

    /// Channel names to tap, in the order given.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels
            .as_deref()
            .unwrap_or("websocket_status,can_frames,state,system_status,temp_status,health_metrics,redis_state")
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Library settings: the file's `settings` block with the flat options on top.
    pub fn to_settings(&self) -> PanopticonSettings {
        let mut settings = self.settings.clone().unwrap_or_default();

        if let Some(ms) = self.batch_interval_ms {
            settings.batch_interval_ms = ms;
        }
        if let Some(uri) = &self.lighthouse_uri {
            settings.lighthouse.uri = uri.clone();
        }
        if let Some(max) = self.max_can_frames {
            settings.lighthouse.max_can_frames = max;
        }
        if let Some(ms) = self.reconnect_max_delay_ms {
            settings.lighthouse.reconnect_max_delay_ms = ms;
        }

        let main = &mut settings.redis_main;
        if let Some(host) = &self.redis_main_host {
            main.host = host.clone();
        }
        if let Some(port) = self.redis_main_port {
            main.port = port;
        }
        if let Some(db) = self.redis_main_db {
            main.db = db;
        }
        if self.redis_main_username.is_some() {
            main.username = self.redis_main_username.clone();
        }
        if self.redis_main_password.is_some() {
            main.password = self.redis_main_password.clone();
        }

        let health = &mut settings.redis_health;
        if let Some(host) = &self.redis_health_host {
            health.host = host.clone();
        }
        if let Some(port) = self.redis_health_port {
            health.port = port;
        }
        if let Some(db) = self.redis_health_db {
            health.db = db;
        }
        if self.redis_health_username.is_some() {
            health.username = self.redis_health_username.clone();
        }
        if self.redis_health_password.is_some() {
            health.password = self.redis_health_password.clone();
        }

        settings
    }
}

fn default_config_locations() -> Vec<PathBuf> {
    let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home_dir) = dirs::home_dir() {
        locations.push(home_dir.join(".config").join("panopticon").join(CONFIG_FILE_NAME));
    }
    locations
}

fn read_config_file(path: &PathBuf) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str::<Config>(&config_str)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Defaults, then the config file, then environment variables and CLI
/// arguments (`cli`, as parsed by clap).
pub fn load_config(cli: Config) -> Result<Config> {
    let mut current_config = Config::default();

    let file_path = match &cli.config_path {
        Some(explicit) => {
            if !explicit.exists() {
                bail!("Config file {} does not exist", explicit.display());
            }
            Some(explicit.clone())
        }
        None => default_config_locations().into_iter().find(|p| p.exists()),
    };

    match file_path {
        Some(path) => {
            let file_config = read_config_file(&path)?;
            log::info!("Loaded config file {}", path.display());
            current_config = current_config.merge(file_config);
        }
        None => {
            log::info!("No config file found. Using defaults and environment/CLI variables.");
        }
    }

    Ok(current_config.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides_file_and_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "lighthouseUri": "ws://file:1",
                "redisMainPort": 7000,
                "backupCount": 9,
                "settings": {{ "lighthouse": {{ "maxCanFrames": 50 }} }}
            }}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            lighthouse_uri: Some("ws://cli:2".to_string()),
            ..Config::default()
        };
        let config = load_config(cli).unwrap();
        let settings = config.to_settings();

        assert_eq!(settings.lighthouse.uri, "ws://cli:2");
        assert_eq!(settings.lighthouse.max_can_frames, 50);
        assert_eq!(settings.redis_main.port, 7000);
        assert_eq!(settings.redis_health.port, 8084);
        assert_eq!(config.backup_count(), 9);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let cli = Config {
            config_path: Some(PathBuf::from("/nonexistent/panopticon.json")),
            ..Config::default()
        };
        assert!(load_config(cli).is_err());
    }

    #[test]
    fn test_channel_names_are_trimmed() {
        let config = Config {
            channels: Some(" logs, can_frames ,,".to_string()),
            ..Config::default()
        };
        assert_eq!(config.channel_names(), vec!["logs".to_string(), "can_frames".to_string()]);
        assert_eq!(Config::default().channel_names().len(), 7);
    }
}
