use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::image::DEFAULT_DOWNLOAD_TEMPLATE;

/// Where entities live, chosen by the scheme of `DESKPOOL_STORAGE_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Postgres(String),
    Memory,
    Wal(PathBuf),
}

impl FromStr for StorageTarget {
    type Err = anyhow::Error;

    fn from_str(url: &str) -> anyhow::Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(StorageTarget::Postgres(url.to_string()))
        } else if url == "memory://" || url == "memory" {
            Ok(StorageTarget::Memory)
        } else if let Some(path) = url.strip_prefix("wal://") {
            if path.is_empty() {
                bail!("wal:// storage url needs a file path");
            }
            Ok(StorageTarget::Wal(PathBuf::from(path)))
        } else {
            bail!("unsupported storage url {url:?} (expected postgres://, memory:// or wal://<path>)")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSinkConfig {
    /// Unset means uploads are kept in memory.
    pub upload_url: Option<String>,
    pub token: Option<String>,
    pub download_template: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub storage: StorageTarget,
    pub image_sink: ImageSinkConfig,
    pub reaper_period: Duration,
    pub reaper_enabled: bool,
    pub listen_addr: SocketAddr,
    pub request_timeout: Duration,
    pub max_in_flight: usize,
    pub metrics_port: Option<u16>,
    pub db_max_connections: u32,
    pub compact_threshold: u64,
    pub fixtures: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = get("DESKPOOL_STORAGE_URL")
            .as_deref()
            .unwrap_or("memory://")
            .parse::<StorageTarget>()
            .context("DESKPOOL_STORAGE_URL")?;

        let reaper_period_seconds: u64 = parse_or(&get, "DESKPOOL_REAPER_PERIOD_SECONDS", 60)?;
        if reaper_period_seconds == 0 {
            bail!("DESKPOOL_REAPER_PERIOD_SECONDS must be positive");
        }
        let request_timeout_ms: u64 = parse_or(&get, "DESKPOOL_REQUEST_TIMEOUT_MS", 10_000)?;
        if request_timeout_ms == 0 {
            bail!("DESKPOOL_REQUEST_TIMEOUT_MS must be positive");
        }
        let max_in_flight: usize = parse_or(&get, "DESKPOOL_MAX_IN_FLIGHT", 256)?;
        if max_in_flight == 0 {
            bail!("DESKPOOL_MAX_IN_FLIGHT must be positive");
        }
        let db_max_connections: u32 = parse_or(&get, "DESKPOOL_DB_MAX_CONNECTIONS", 10)?;
        if db_max_connections == 0 {
            bail!("DESKPOOL_DB_MAX_CONNECTIONS must be positive");
        }

        Ok(Config {
            storage,
            image_sink: ImageSinkConfig {
                upload_url: get("DESKPOOL_IMAGE_SINK_URL"),
                token: get("DESKPOOL_IMAGE_SINK_TOKEN"),
                download_template: get("DESKPOOL_IMAGE_SINK_DOWNLOAD_TEMPLATE")
                    .unwrap_or_else(|| DEFAULT_DOWNLOAD_TEMPLATE.to_string()),
            },
            reaper_period: Duration::from_secs(reaper_period_seconds),
            reaper_enabled: parse_bool_or(&get, "DESKPOOL_REAPER_ENABLED", true)?,
            listen_addr: parse_or(&get, "DESKPOOL_HTTP_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            request_timeout: Duration::from_millis(request_timeout_ms),
            max_in_flight,
            metrics_port: get("DESKPOOL_METRICS_PORT")
                .map(|v| v.parse::<u16>().with_context(|| format!("DESKPOOL_METRICS_PORT={v:?}")))
                .transpose()?,
            db_max_connections,
            compact_threshold: parse_or(&get, "DESKPOOL_COMPACT_THRESHOLD", 1000)?,
            fixtures: get("DESKPOOL_FIXTURES").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().with_context(|| format!("{key}={raw:?}")),
        None => Ok(default),
    }
}

fn parse_bool_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> anyhow::Result<bool> {
    let Some(raw) = get(key) else { return Ok(default) };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("{key}={raw:?} is not a boolean"),
    }
}
