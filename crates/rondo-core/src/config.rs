use std::fmt::Display;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::Limits;
use crate::error::{Error, Result};
use crate::server::DEFAULT_BACKLOG;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value of the `Server` header (default: rondo)
    pub name: String,

    /// Bind host (default: 127.0.0.1)
    pub host: String,

    /// Bind port (default: 8080)
    pub port: u16,

    /// Prefix prepended to every registered route (default: empty)
    pub base_uri: String,

    /// Worker threads; 0 means one per CPU (default: 1)
    pub threads: usize,

    /// Scheduled command tick in milliseconds (default: 3000)
    pub scheduled_interval_ms: u64,

    /// Abort the process when file descriptors or memory run out
    pub abort_on_resource_error: bool,

    /// Largest accepted request head in bytes (default: 64 KiB)
    pub max_header_bytes: usize,

    /// Largest buffered request body in bytes (default: 16 MiB)
    pub max_body_bytes: usize,

    /// Listen backlog (default: 1024)
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            name: "rondo".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            base_uri: String::new(),
            threads: 1,
            scheduled_interval_ms: 3000,
            abort_on_resource_error: false,
            max_header_bytes: limits.max_head_bytes,
            max_body_bytes: limits.max_body_bytes,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `RONDO_*` environment variables (with .env
    /// support). Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            name: lookup("RONDO_NAME").unwrap_or(defaults.name),
            host: lookup("RONDO_HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "RONDO_PORT", defaults.port)?,
            base_uri: lookup("RONDO_BASE_URI").unwrap_or(defaults.base_uri),
            threads: parse(&lookup, "RONDO_THREADS", defaults.threads)?,
            scheduled_interval_ms: parse(
                &lookup,
                "RONDO_SCHEDULED_INTERVAL_MS",
                defaults.scheduled_interval_ms,
            )?,
            abort_on_resource_error: match lookup("RONDO_ABORT_ON_RESOURCE_ERROR") {
                Some(raw) => parse_flag("RONDO_ABORT_ON_RESOURCE_ERROR", &raw)?,
                None => defaults.abort_on_resource_error,
            },
            max_header_bytes: parse(&lookup, "RONDO_MAX_HEADER_BYTES", defaults.max_header_bytes)?,
            max_body_bytes: parse(&lookup, "RONDO_MAX_BODY_BYTES", defaults.max_body_bytes)?,
            backlog: parse(&lookup, "RONDO_BACKLOG", defaults.backlog)?,
        })
    }

    /// Worker count to pass to `Server::run`.
    pub fn thread_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    pub fn scheduled_interval(&self) -> Duration {
        Duration::from_millis(self.scheduled_interval_ms)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_head_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
            ..Limits::default()
        }
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("{} resolves to no address", self.server_addr())))
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?}: expected a boolean", key, raw))),
    }
}
