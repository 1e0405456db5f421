use std::env;
use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

use crate::models::StreamUrlMode;

/// Configuration problems detected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,

    // Account
    pub username: String,
    pub password: String,

    // Storage
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,

    // Guide fetching
    pub guide_days: u32,
    pub guide_window_hours: u32,
    pub guide_max_channels: usize,
    pub guide_min_ratio: f64,
    pub fetch_concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub playback_probe: bool,

    // Output
    pub stream_url_mode: StreamUrlMode,
    pub m3u_playable_only: bool,
    pub group_title: String,
    pub chno_start: u32,
    pub xmltv_timezone: String,
    pub xmltv_id_prefix: String,
    pub prismcast_host: Option<String>,
    pub prismcast_port: u16,

    // Scheduling
    pub refresh_hour: u32,
    pub refresh_minute: u32,
    pub timezone: String,
    pub initial_refresh_delay_secs: u64,
    pub refresh_timeout_secs: u64,
    pub history_limit: usize,

    // Session / browser
    pub session_max_age_hours: i64,
    pub session_expiry_skew_secs: i64,
    pub login_attempts: u32,
    pub login_timeout_secs: u64,
    pub browser_path: String,
    pub browser_headless: bool,
    pub user_agent: String,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag_or(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        // DTV_EMAIL wins over DTV_USERNAME when both are set
        let username = env::var("DTV_EMAIL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| env::var("DTV_USERNAME").ok())
            .unwrap_or_default();

        Self {
            // Server
            port: parse_or("WEB_PORT", 8675),

            // Account
            username,
            password: var_or("DTV_PASSWORD", ""),

            // Storage
            data_dir: PathBuf::from(var_or("DATA_DIR", "data")),
            out_dir: PathBuf::from(var_or("OUT_DIR", "out")),

            // Guide fetching - smaller batches mean fewer per-channel fallbacks
            guide_days: parse_or("GUIDE_DAYS", 3),
            guide_window_hours: parse_or("GUIDE_WINDOW_HOURS", 6),
            guide_max_channels: parse_or("GUIDE_MAX_CHANNELS", 20),
            guide_min_ratio: parse_or("GUIDE_MIN_RATIO", 0.75),
            fetch_concurrency: parse_or("FETCH_CONCURRENCY", 4),
            fetch_timeout_secs: parse_or("FETCH_TIMEOUT_SECS", 30),
            max_retries: parse_or("MAX_RETRIES", 3),
            retry_backoff_ms: parse_or("RETRY_BACKOFF_MS", 1000),
            playback_probe: flag_or("PLAYBACK_PROBE", true),

            // Output
            stream_url_mode: var_or("STREAM_URL_MODE", "deeplink")
                .parse()
                .unwrap_or_default(),
            m3u_playable_only: flag_or("M3U_PLAYABLE_ONLY", false),
            group_title: var_or("GROUP_TITLE", "DirecTV Stream"),
            chno_start: parse_or("CHNO_START", 0),
            xmltv_timezone: var_or("XMLTV_TIMEZONE", "UTC"),
            xmltv_id_prefix: var_or("XMLTV_ID_PREFIX", "dtv-"),
            prismcast_host: env::var("PRISMCAST_HOST")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            prismcast_port: parse_or("PRISMCAST_PORT", 5589),

            // Scheduling
            refresh_hour: parse_or("REFRESH_HOUR", 3),
            refresh_minute: parse_or("REFRESH_MINUTE", 0),
            timezone: var_or("TZ", "America/New_York"),
            initial_refresh_delay_secs: parse_or("INITIAL_REFRESH_DELAY_SECS", 120),
            refresh_timeout_secs: parse_or("REFRESH_TIMEOUT_SECS", 1800), // 30 minutes
            history_limit: parse_or("HISTORY_LIMIT", 50),

            // Session / browser
            session_max_age_hours: parse_or("SESSION_MAX_AGE_HOURS", 12),
            session_expiry_skew_secs: parse_or("SESSION_EXPIRY_SKEW_SECS", 300),
            login_attempts: parse_or("LOGIN_ATTEMPTS", 3),
            login_timeout_secs: parse_or("LOGIN_TIMEOUT_SECS", 60),
            browser_path: var_or("BROWSER_PATH", "chromium"),
            browser_headless: flag_or("BROWSER_HEADLESS", true),
            // DirecTV Stream only supports Chrome/Edge/Safari
            user_agent: var_or(
                "USER_AGENT",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            ),
        }
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("DTV_USERNAME"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("DTV_PASSWORD"));
        }
        self.scheduler_tz()?;
        self.output_tz()?;

        if self.guide_days == 0 || self.guide_days > 14 {
            return Err(ConfigError::Invalid {
                key: "GUIDE_DAYS",
                value: self.guide_days.to_string(),
            });
        }
        if self.guide_window_hours == 0 {
            return Err(ConfigError::Invalid {
                key: "GUIDE_WINDOW_HOURS",
                value: self.guide_window_hours.to_string(),
            });
        }
        if self.guide_max_channels == 0 {
            return Err(ConfigError::Invalid {
                key: "GUIDE_MAX_CHANNELS",
                value: self.guide_max_channels.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.guide_min_ratio) {
            return Err(ConfigError::Invalid {
                key: "GUIDE_MIN_RATIO",
                value: self.guide_min_ratio.to_string(),
            });
        }
        if self.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "FETCH_CONCURRENCY",
                value: self.fetch_concurrency.to_string(),
            });
        }
        if self.refresh_hour > 23 || self.refresh_minute > 59 {
            return Err(ConfigError::Invalid {
                key: "REFRESH_HOUR/REFRESH_MINUTE",
                value: format!("{}:{}", self.refresh_hour, self.refresh_minute),
            });
        }
        if self.login_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "LOGIN_ATTEMPTS",
                value: self.login_attempts.to_string(),
            });
        }
        Ok(())
    }

    /// Zone the daily refresh is scheduled in
    pub fn scheduler_tz(&self) -> Result<Tz, ConfigError> {
        self.timezone.parse().map_err(|_| ConfigError::Invalid {
            key: "TZ",
            value: self.timezone.clone(),
        })
    }

    /// Zone XMLTV timestamps are rendered in
    pub fn output_tz(&self) -> Result<Tz, ConfigError> {
        self.xmltv_timezone.parse().map_err(|_| ConfigError::Invalid {
            key: "XMLTV_TIMEZONE",
            value: self.xmltv_timezone.clone(),
        })
    }

    /// Where the session artifact is persisted
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// Chromium profile kept between logins
    pub fn browser_profile_dir(&self) -> PathBuf {
        self.data_dir.join("browser-profile")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("refresh_history.ndjson")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
