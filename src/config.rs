//! # Configuration
//!
//! Everything is read from environment variables once at startup. Missing
//! values fall back to a logged default, malformed values abort startup.
//!
//! | Variable                   | Default       |
//! |----------------------------|---------------|
//! | `PORT`                     | `3000`        |
//! | `BIND_ADDR`                | `127.0.0.1`   |
//! | `DATA_DIR`                 | `database`    |
//! | `SESSION_TTL_SECS`         | `86400`       |
//! | `NUTRITION_API_URL`        | unset         |
//! | `NUTRITION_API_KEY`        | unset         |
//! | `IMAGE_COMPRESS_THRESHOLD` | `1048576`     |
//! | `IMAGE_MAX_BYTES`          | `4194304`     |
//! | `HTTP_TIMEOUT_SECS`        | `20`          |
//! | `DEFAULT_WATER_GOAL`       | `8`           |
//! | `SMTP_HOST` / `SMTP_USER` / `SMTP_PASSWORD` / `SMTP_FROM` | unset |
use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub session_ttl_secs: u64,
    pub nutrition_api_url: Option<String>,
    pub nutrition_api_key: Option<String>,
    pub image_compress_threshold: usize,
    pub image_max_bytes: usize,
    pub http_timeout_secs: u64,
    pub default_water_goal: u32,
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    pub fn load() -> Self {
        let smtp = match (
            optional("SMTP_HOST"),
            optional("SMTP_USER"),
            optional("SMTP_PASSWORD"),
        ) {
            (Some(host), Some(user), Some(password)) => Some(SmtpConfig {
                from: optional("SMTP_FROM").unwrap_or_else(|| user.clone()),
                host,
                user,
                password,
            }),
            _ => {
                info!("SMTP not configured, password reset mails are disabled");
                None
            }
        };

        Self {
            port: try_load("PORT", "3000"),
            bind_addr: try_load("BIND_ADDR", "127.0.0.1"),
            data_dir: try_load::<String>("DATA_DIR", "database").into(),
            session_ttl_secs: try_load("SESSION_TTL_SECS", "86400"),
            nutrition_api_url: optional("NUTRITION_API_URL"),
            nutrition_api_key: optional("NUTRITION_API_KEY"),
            image_compress_threshold: try_load("IMAGE_COMPRESS_THRESHOLD", "1048576"),
            image_max_bytes: try_load("IMAGE_MAX_BYTES", "4194304"),
            http_timeout_secs: try_load("HTTP_TIMEOUT_SECS", "20"),
            default_water_goal: try_load("DEFAULT_WATER_GOAL", "8"),
            smtp,
        }
    }

    /// Defaults with the database rooted at `data_dir`, no analyzer and no SMTP.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 3000,
            bind_addr: "127.0.0.1".to_string(),
            data_dir: data_dir.into(),
            session_ttl_secs: 24 * 60 * 60,
            nutrition_api_url: None,
            nutrition_api_key: None,
            image_compress_threshold: 1024 * 1024,
            image_max_bytes: 4 * 1024 * 1024,
            http_timeout_secs: 20,
            default_water_goal: 8,
            smtp: None,
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
