use crate::connection::{ReconnectPolicy, StreamConfig};
use crate::errors::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://db/mower-data.sqlite";
pub const DEFAULT_AUTH_URL: &str = "https://api.authentication.husqvarnagroup.dev/v1/oauth2/token";
pub const DEFAULT_STREAM_URL: &str = "wss://ws.openapi.husqvarna.dev/v1";
pub const DEFAULT_MOWER_API_URL: &str = "https://api.amc.husqvarna.dev/v1";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_secret: String,
    pub database_url: String,
    pub http_addr: String,
    pub auth_url: String,
    pub stream_url: String,
    pub mower_api_url: String,
    pub keepalive: Duration,
    pub reconnect: ReconnectPolicy,
    pub channel_capacity: usize,
    pub messages_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = text("HQ_API_KEY")
            .ok_or_else(|| Error::Config("HQ_API_KEY is required".to_string()))?;
        let api_secret = text("HQ_API_SECRET")
            .ok_or_else(|| Error::Config("HQ_API_SECRET is required".to_string()))?;

        let keepalive_secs = parse_or_default(&lookup, "KEEPALIVE_SECS", 60_u64)?;
        if keepalive_secs == 0 {
            return Err(Error::Config("KEEPALIVE_SECS must be positive".to_string()));
        }
        let channel_capacity = parse_or_default(&lookup, "CHANNEL_CAPACITY", 10_000_usize)?;
        if channel_capacity == 0 {
            return Err(Error::Config("CHANNEL_CAPACITY must be positive".to_string()));
        }

        Ok(Self {
            api_key,
            api_secret,
            database_url: text("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            http_addr: text("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            auth_url: text("AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            stream_url: text("STREAM_URL").unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            mower_api_url: text("MOWER_API_URL").unwrap_or_else(|| DEFAULT_MOWER_API_URL.to_string()),
            keepalive: Duration::from_secs(keepalive_secs),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(parse_or_default(&lookup, "RECONNECT_BASE_MS", 1000_u64)?),
                cap: Duration::from_millis(parse_or_default(&lookup, "RECONNECT_CAP_MS", 60_000_u64)?),
                jitter_max: Duration::from_millis(parse_or_default(
                    &lookup,
                    "RECONNECT_JITTER_MS",
                    1000_u64,
                )?),
            },
            channel_capacity,
            messages_file: text("MESSAGES_FILE").map(PathBuf::from),
        })
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            url: self.stream_url.clone(),
            keepalive: self.keepalive,
            reconnect: self.reconnect,
        }
    }
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| Error::Config(format!("{} must be a valid number", key))),
        None => Ok(default),
    }
}
