//! Client configuration.
//!
//! Defaults match the production deployment; every tunable can be
//! overridden from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockcount_core::display::DEFAULT_UTC_OFFSET_MINUTES;
use stockcount_core::session::DEFAULT_OPERATOR_TIMEOUT_MINUTES;
use stockcount_core::stock::DEFAULT_NAME_LIMIT;
use stockcount_core::{FormatWhitelist, TimestampStyle};

pub const ENV_SCAN_COOLDOWN_MS: &str = "STOCKCOUNT_SCAN_COOLDOWN_MS";
pub const ENV_OPERATOR_TIMEOUT_SECS: &str = "STOCKCOUNT_OPERATOR_TIMEOUT_SECS";
pub const ENV_RETRY_ATTEMPTS: &str = "STOCKCOUNT_RETRY_ATTEMPTS";
pub const ENV_RETRY_DELAY_MS: &str = "STOCKCOUNT_RETRY_DELAY_MS";
pub const ENV_BATCH_SIZE: &str = "STOCKCOUNT_BATCH_SIZE";
pub const ENV_SYNC_INTERVAL_SECS: &str = "STOCKCOUNT_SYNC_INTERVAL_SECS";
pub const ENV_FORMATS: &str = "STOCKCOUNT_FORMATS";
pub const ENV_DISPLAY_UTC_OFFSET_MIN: &str = "STOCKCOUNT_DISPLAY_UTC_OFFSET_MIN";
pub const ENV_BUDDHIST_ERA: &str = "STOCKCOUNT_BUDDHIST_ERA";
pub const ENV_BACKEND_URL: &str = "STOCKCOUNT_BACKEND_URL";
pub const ENV_BACKEND_KEY: &str = "STOCKCOUNT_BACKEND_KEY";
pub const ENV_DATA_DIR: &str = "STOCKCOUNT_DATA_DIR";

/// Confirmation code for destructive administrative actions.
pub const DEFAULT_RESET_CODE: &str = "P12345678";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("could not resolve a data directory; set STOCKCOUNT_DATA_DIR")]
    NoDataDir,
}

/// Accepted barcode format set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FormatProfile {
    /// `CODE_128` and `CODE_39` only.
    #[default]
    Strict,
    /// Common 1D and 2D symbologies.
    Wide,
}

impl FormatProfile {
    pub fn whitelist(&self) -> FormatWhitelist {
        match self {
            FormatProfile::Strict => FormatWhitelist::strict(),
            FormatProfile::Wide => FormatWhitelist::wide(),
        }
    }
}

impl FromStr for FormatProfile {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(FormatProfile::Strict),
            "wide" => Ok(FormatProfile::Wide),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub scan_cooldown: Duration,
    pub operator_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub format_profile: FormatProfile,
    pub max_name_len: usize,
    pub reset_code: String,
    pub display_offset_minutes: i32,
    pub buddhist_era: bool,
    pub backend_url: Option<String>,
    pub backend_key: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            scan_cooldown: Duration::from_millis(3000),
            operator_timeout: Duration::from_secs(DEFAULT_OPERATOR_TIMEOUT_MINUTES as u64 * 60),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            batch_size: 20,
            sync_interval: Duration::from_secs(60),
            format_profile: FormatProfile::Strict,
            max_name_len: DEFAULT_NAME_LIMIT,
            reset_code: DEFAULT_RESET_CODE.to_string(),
            display_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            buddhist_era: true,
            backend_url: None,
            backend_key: None,
            data_dir: None,
        }
    }
}

impl ClientConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, ENV_SCAN_COOLDOWN_MS)? {
            cfg.scan_cooldown = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_positive::<u64>(&lookup, ENV_OPERATOR_TIMEOUT_SECS)? {
            cfg.operator_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive::<u32>(&lookup, ENV_RETRY_ATTEMPTS)? {
            cfg.retry_attempts = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, ENV_RETRY_DELAY_MS)? {
            cfg.retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_positive::<usize>(&lookup, ENV_BATCH_SIZE)? {
            cfg.batch_size = n;
        }
        if let Some(secs) = parse_positive::<u64>(&lookup, ENV_SYNC_INTERVAL_SECS)? {
            cfg.sync_interval = Duration::from_secs(secs);
        }
        if let Some(profile) = parse::<FormatProfile>(&lookup, ENV_FORMATS)? {
            cfg.format_profile = profile;
        }
        if let Some(offset) = parse::<i32>(&lookup, ENV_DISPLAY_UTC_OFFSET_MIN)? {
            cfg.display_offset_minutes = offset;
        }
        if let Some(era) = parse::<bool>(&lookup, ENV_BUDDHIST_ERA)? {
            cfg.buddhist_era = era;
        }

        cfg.backend_url = non_empty(lookup(ENV_BACKEND_URL));
        cfg.backend_key = non_empty(lookup(ENV_BACKEND_KEY));
        cfg.data_dir = non_empty(lookup(ENV_DATA_DIR)).map(PathBuf::from);

        // Fail early rather than at first render.
        cfg.timestamp_style()?;
        Ok(cfg)
    }

    pub fn timestamp_style(&self) -> Result<TimestampStyle, ConfigError> {
        TimestampStyle::new(self.display_offset_minutes, self.buddhist_era).ok_or_else(|| {
            ConfigError::Invalid {
                var: ENV_DISPLAY_UTC_OFFSET_MIN,
                value: self.display_offset_minutes.to_string(),
            }
        })
    }

    /// Scan cooldown as a domain duration.
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.scan_cooldown).unwrap_or(chrono::Duration::MAX)
    }

    /// Operator timeout as a domain duration.
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.operator_timeout).unwrap_or(chrono::Duration::MAX)
    }

    /// Configured data directory, else the OS data directory + `stockcount`.
    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_dir()
            .or_else(|| {
                dirs::home_dir().map(|mut h| {
                    h.push(".local");
                    h.push("share");
                    h
                })
            })
            .ok_or(ConfigError::NoDataDir)?;
        Ok(base.join("stockcount"))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match non_empty(lookup(var)) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq + ToString,
{
    match parse::<T>(lookup, var)? {
        Some(v) if v == T::default() => Err(ConfigError::Invalid {
            var,
            value: v.to_string(),
        }),
        other => Ok(other),
    }
}
