//! Configuration loading and validation.
//!
//! `proxy.conf` is read once at startup, in either INI or JSON form,
//! into a [`RawConfig`], then validated into a typed [`ProxyConfig`].
//! Everything downstream of `ProxyConfig::load` treats configuration
//! as read-only.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ProxyError;

/// `thread_per_connection` spawns a fresh task per accepted
/// connection with no admission control; `thread_pool` hands
/// connections to a bounded [`crate::pool::WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyModel {
    ThreadPerConnection,
    ThreadPool,
}

impl ConcurrencyModel {
    fn parse(value: &str) -> Result<Self, ProxyError> {
        match value {
            "thread_per_connection" => Ok(ConcurrencyModel::ThreadPerConnection),
            "thread_pool" => Ok(ConcurrencyModel::ThreadPool),
            other => Err(ProxyError::ConfigInvalid(format!(
                "unknown concurrency_model: {other}"
            ))),
        }
    }
}

/// the validated, typed configuration record the rest of the core
/// consumes. Constructed only via [`ProxyConfig::load`] or
/// [`ProxyConfig::from_raw`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub concurrency_model: ConcurrencyModel,
    pub thread_pool_size: usize,
    pub log_file_path: PathBuf,
    pub log_max_size_mb: u64,
    pub blocked_domains_file: Option<PathBuf>,
    pub enable_caching: bool,
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    pub enable_connect_tunneling: bool,
    pub authentication_token: String,
}

const DEFAULT_CACHE_MAX_BYTES: usize = 100 * 1024 * 1024;

/// the unvalidated, all-optional form produced by parsing either file
/// format. Unknown keys are kept in `extra` but never consulted.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub concurrency_model: Option<String>,
    pub thread_pool_size: Option<usize>,
    pub log_file_path: Option<String>,
    pub log_max_size_mb: Option<u64>,
    pub blocked_domains_file: Option<String>,
    pub enable_caching: Option<bool>,
    pub cache_max_entries: Option<usize>,
    pub enable_connect_tunneling: Option<bool>,
    pub authentication_token: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProxyConfig {
    /// load and validate a config file, sniffing INI vs JSON from the
    /// first non-whitespace byte.
    pub fn load(path: &Path) -> Result<ProxyConfig, ProxyError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let raw = if text.trim_start().starts_with('{') {
            parse_json(&text)?
        } else {
            parse_ini(&text)
        };
        ProxyConfig::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<ProxyConfig, ProxyError> {
        let listen_address = raw.listen_address.unwrap_or_else(|| "0.0.0.0".to_string());
        let listen_port = raw
            .listen_port
            .ok_or_else(|| ProxyError::ConfigInvalid("listen_port is required".into()))?;
        if listen_port == 0 {
            return Err(ProxyError::ConfigInvalid(
                "listen_port must be in [1, 65535]".into(),
            ));
        }
        let ip: IpAddr = listen_address.parse().map_err(|_| {
            ProxyError::ConfigInvalid(format!("invalid listen_address: {listen_address}"))
        })?;
        let listen_addr = SocketAddr::new(ip, listen_port);

        let concurrency_model = match raw.concurrency_model.as_deref() {
            Some(s) => ConcurrencyModel::parse(s)?,
            None => ConcurrencyModel::ThreadPerConnection,
        };

        let thread_pool_size = raw.thread_pool_size.unwrap_or(4);
        if concurrency_model == ConcurrencyModel::ThreadPool && thread_pool_size < 1 {
            return Err(ProxyError::ConfigInvalid(
                "thread_pool_size must be >= 1".into(),
            ));
        }

        let log_max_size_mb = raw.log_max_size_mb.unwrap_or(10);
        if log_max_size_mb < 1 {
            return Err(ProxyError::ConfigInvalid(
                "log_max_size_mb must be >= 1".into(),
            ));
        }

        let enable_caching = raw.enable_caching.unwrap_or(false);
        let cache_max_entries = raw.cache_max_entries.unwrap_or(100);
        if enable_caching && cache_max_entries < 1 {
            return Err(ProxyError::ConfigInvalid(
                "cache_max_entries must be >= 1 when caching is enabled".into(),
            ));
        }

        Ok(ProxyConfig {
            listen_addr,
            concurrency_model,
            thread_pool_size,
            log_file_path: raw
                .log_file_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("proxy.log")),
            log_max_size_mb,
            blocked_domains_file: raw.blocked_domains_file.map(PathBuf::from),
            enable_caching,
            cache_max_entries,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            enable_connect_tunneling: raw.enable_connect_tunneling.unwrap_or(true),
            authentication_token: raw.authentication_token.unwrap_or_default(),
        })
    }
}

/// `key=value` lines; `#` begins a whole-line or inline comment;
/// blank lines are skipped; unknown keys are ignored.
pub fn parse_ini(text: &str) -> RawConfig {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        map.insert(
            key.trim().to_string(),
            serde_json::Value::String(value.trim().to_string()),
        );
    }
    raw_from_map(map)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_json(text: &str) -> Result<RawConfig, ProxyError> {
    serde_json::from_str(text)
        .map_err(|e| ProxyError::ConfigInvalid(format!("invalid JSON config: {e}")))
}

/// builds a [`RawConfig`] from loosely-typed INI key/value strings by
/// round-tripping through JSON, the same string-typed values a JSON
/// config would supply verbatim; `serde` coerces quoted numbers/bools.
fn raw_from_map(map: HashMap<String, serde_json::Value>) -> RawConfig {
    let get_str = |k: &str| map.get(k).and_then(|v| v.as_str()).map(|s| s.to_string());
    let get_u16 = |k: &str| get_str(k).and_then(|s| s.parse::<u16>().ok());
    let get_u64 = |k: &str| get_str(k).and_then(|s| s.parse::<u64>().ok());
    let get_usize = |k: &str| get_str(k).and_then(|s| s.parse::<usize>().ok());
    let get_bool = |k: &str| get_str(k).and_then(|s| s.parse::<bool>().ok());

    RawConfig {
        listen_address: get_str("listen_address"),
        listen_port: get_u16("listen_port"),
        concurrency_model: get_str("concurrency_model"),
        thread_pool_size: get_usize("thread_pool_size"),
        log_file_path: get_str("log_file_path"),
        log_max_size_mb: get_u64("log_max_size_mb"),
        blocked_domains_file: get_str("blocked_domains_file"),
        enable_caching: get_bool("enable_caching"),
        cache_max_entries: get_usize("cache_max_entries"),
        enable_connect_tunneling: get_bool("enable_connect_tunneling"),
        authentication_token: get_str("authentication_token"),
        extra: HashMap::new(),
    }
}
