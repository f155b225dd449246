use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::posting::MAX_COOLDOWN;
use crate::site::{BoardCooldowns, HttpSiteConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Site
    pub site_name: String,
    pub site_base_url: String,
    pub site_logged_in: bool,
    pub site_ignore_reply_cooldowns: bool,
    pub cooldown_threads_secs: u64,
    pub cooldown_replies_secs: u64,
    pub cooldown_images_secs: u64,
    pub request_timeout: Duration,

    // Database
    pub database_path: PathBuf,

    // Posting
    pub pin_thread_on_post: bool,
    pub exit_when_idle: bool,

    // Web Server
    pub web_host: String,
    pub web_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Site
            site_name: env_or_default("SITE_NAME", "chan"),
            site_base_url: required_env("SITE_BASE_URL")?,
            site_logged_in: parse_env_bool("SITE_LOGGED_IN", false)?,
            site_ignore_reply_cooldowns: parse_env_bool("SITE_IGNORE_REPLY_COOLDOWNS", false)?,
            cooldown_threads_secs: parse_env_u64("COOLDOWN_THREADS_SECS", 0)?,
            cooldown_replies_secs: parse_env_u64("COOLDOWN_REPLIES_SECS", 0)?,
            cooldown_images_secs: parse_env_u64("COOLDOWN_IMAGES_SECS", 0)?,
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 120)?),

            // Database
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/replies.sqlite")),

            // Posting
            pin_thread_on_post: parse_env_bool("PIN_THREAD_ON_POST", false)?,
            exit_when_idle: parse_env_bool("EXIT_WHEN_IDLE", false)?,

            // Web Server
            web_host: env_or_default("WEB_HOST", "127.0.0.1"),
            web_port: parse_env_u16("WEB_PORT", 8080)?,
        })
    }

    /// Configuration for tests: a local site and no cooldowns.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            site_name: "test".to_string(),
            site_base_url: "http://127.0.0.1:9".to_string(),
            site_logged_in: false,
            site_ignore_reply_cooldowns: false,
            cooldown_threads_secs: 0,
            cooldown_replies_secs: 0,
            cooldown_images_secs: 0,
            request_timeout: Duration::from_secs(5),
            database_path: PathBuf::from("./data/test-replies.sqlite"),
            pin_thread_on_post: false,
            exit_when_idle: false,
            web_host: "127.0.0.1".to_string(),
            web_port: 0,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.site_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "SITE_NAME".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        match url::Url::parse(&self.site_base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::InvalidValue {
                    name: "SITE_BASE_URL".to_string(),
                    message: format!("unsupported scheme '{}'", url.scheme()),
                });
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    name: "SITE_BASE_URL".to_string(),
                    message: e.to_string(),
                });
            }
        }
        let max_cooldown_secs = MAX_COOLDOWN.as_secs();
        for (name, secs) in [
            ("COOLDOWN_THREADS_SECS", self.cooldown_threads_secs),
            ("COOLDOWN_REPLIES_SECS", self.cooldown_replies_secs),
            ("COOLDOWN_IMAGES_SECS", self.cooldown_images_secs),
        ] {
            if secs > max_cooldown_secs {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: format!("must be at most {max_cooldown_secs}"),
                });
            }
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Settings for the configured site.
    #[must_use]
    pub fn http_site(&self) -> HttpSiteConfig {
        HttpSiteConfig {
            name: self.site_name.clone(),
            base_url: self.site_base_url.clone(),
            logged_in: self.site_logged_in,
            ignore_reply_cooldowns: self.site_ignore_reply_cooldowns,
            cooldowns: BoardCooldowns {
                threads: self.cooldown_threads_secs,
                replies: self.cooldown_replies_secs,
                images: self.cooldown_images_secs,
            },
            request_timeout: self.request_timeout,
        }
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}
