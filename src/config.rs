use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // register commands on one guild only

    // Audio
    pub default_volume: f32,

    // Paths
    pub download_dir: PathBuf,
    pub data_dir: PathBuf,

    // Timeouts and intervals
    pub fetch_timeout: Duration,
    pub upload_timeout: Duration,
    pub tracker_interval: Duration,
    pub session_idle_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.download_dir)?;

        config.validate()?;
        Ok(config)
    }

    /// Builds a config from any key/value source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            guild_id: var("GUILD_ID").map(|s| parse("GUILD_ID", &s)).transpose()?,

            default_volume: parse_or(&var, "DEFAULT_VOLUME", defaults.default_volume)?,

            download_dir: var("DOWNLOAD_DIR").map_or(defaults.download_dir, PathBuf::from),
            data_dir: var("DATA_DIR").map_or(defaults.data_dir, PathBuf::from),

            fetch_timeout: secs_or(&var, "FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            upload_timeout: secs_or(&var, "UPLOAD_TIMEOUT_SECS", defaults.upload_timeout)?,
            tracker_interval: var("TRACKER_INTERVAL_MS")
                .map(|s| parse("TRACKER_INTERVAL_MS", &s).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.tracker_interval),
            session_idle_timeout: secs_or(&var, "SESSION_IDLE_TIMEOUT_SECS", defaults.session_idle_timeout)?,
            maintenance_interval: secs_or(&var, "MAINTENANCE_INTERVAL_SECS", defaults.maintenance_interval)?,
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - Timeouts and intervals must be non-zero
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 2.0, got: {}", self.default_volume);
        }

        for (name, value) in [
            ("Fetch timeout", self.fetch_timeout),
            ("Upload timeout", self.upload_timeout),
            ("Tracker interval", self.tracker_interval),
            ("Session idle timeout", self.session_idle_timeout),
            ("Maintenance interval", self.maintenance_interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands on {}\n  \
            Audio: {}% vol\n  \
            Paths: downloads {}, data {}\n  \
            Timeouts: fetch {}, upload {}\n  \
            Sessions: tracker every {}, idle after {}, maintenance every {}",
            self.guild_id.map_or("all guilds".to_string(), |id| format!("guild {id}")),
            (self.default_volume * 100.0).round() as u32,
            self.download_dir.display(),
            self.data_dir.display(),
            humantime::format_duration(self.fetch_timeout),
            humantime::format_duration(self.upload_timeout),
            humantime::format_duration(self.tracker_interval),
            humantime::format_duration(self.session_idle_timeout),
            humantime::format_duration(self.maintenance_interval),
        )
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} has an invalid value: {raw:?}"))
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key).map_or(Ok(default), |raw| parse(key, &raw))
}

fn secs_or(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    parse_or(var, key, default.as_secs()).map(Duration::from_secs)
}

/// Default configuration values.
impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            guild_id: None,

            default_volume: 0.1,

            download_dir: "./downloads".into(),
            data_dir: "./data".into(),

            fetch_timeout: Duration::from_secs(600),
            upload_timeout: Duration::from_secs(300),
            tracker_interval: Duration::from_secs(1),
            session_idle_timeout: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_token_is_set() {
        let config = config_from(&[("DISCORD_TOKEN", "token")]).unwrap();

        assert_eq!(config.discord_token, "token");
        assert_eq!(config.guild_id, None);
        assert_eq!(config.default_volume, 0.1);
        assert_eq!(config.fetch_timeout, Duration::from_secs(600));
        assert_eq!(config.tracker_interval, Duration::from_millis(1000));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn token_is_required() {
        assert!(config_from(&[]).is_err());
        assert!(config_from(&[("DISCORD_TOKEN", "  ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "1234"),
            ("DEFAULT_VOLUME", "0.5"),
            ("FETCH_TIMEOUT_SECS", "30"),
            ("TRACKER_INTERVAL_MS", "250"),
            ("DOWNLOAD_DIR", "/srv/audio"),
        ])
        .unwrap();

        assert_eq!(config.guild_id, Some(1234));
        assert_eq!(config.default_volume, 0.5);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.tracker_interval, Duration::from_millis(250));
        assert_eq!(config.download_dir, PathBuf::from("/srv/audio"));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config_from(&[("DISCORD_TOKEN", "token"), ("FETCH_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("FETCH_TIMEOUT_SECS"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let loud = Config {
            default_volume: 3.0,
            ..Config::default()
        };
        assert!(loud.validate().is_err());

        let frozen = Config {
            tracker_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(frozen.validate().is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let config = config_from(&[("DISCORD_TOKEN", "token"), ("SESSION_IDLE_TIMEOUT_SECS", "0")]).unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Session idle timeout"));
    }

    #[test]
    fn summary_hides_the_token() {
        let config = Config {
            discord_token: "secret".into(),
            ..Config::default()
        };
        let summary = config.summary();

        assert!(!summary.contains("secret"));
        assert!(summary.contains("10% vol"));
        assert!(summary.contains("fetch 10m"));
    }
}
