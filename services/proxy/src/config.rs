//! Proxy configuration.
//!
//! Loaded once from the environment at startup; there is no hot reload.
//! Any invalid or missing required value refuses startup.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default TCP workers per port.
pub const DEFAULT_WORKERS: usize = 4;

/// Default copy buffer for each pump direction.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration errors. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("invalid route '{route}': {reason}")]
    InvalidRoute { route: String, reason: String },

    #[error("port {0} is routed more than once")]
    DuplicatePort(u16),
}

/// Which transports a port forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Both,
}

impl Transport {
    pub fn tcp(&self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    pub fn udp(&self) -> bool {
        matches!(self, Self::Udp | Self::Both)
    }
}

/// The remote service a port forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// One public port and its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRoute {
    pub listen_port: u16,
    pub backend: BackendTarget,
    pub transport: Transport,
}

impl FromStr for PortRoute {
    type Err = ConfigError;

    /// Parse `port=host:port[/tcp|/udp|/both]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidRoute {
            route: s.to_string(),
            reason: reason.to_string(),
        };

        let (listen, target) = s
            .trim()
            .split_once('=')
            .ok_or_else(|| invalid("expected port=host:port"))?;
        let listen_port: u16 = listen
            .trim()
            .parse()
            .map_err(|_| invalid("listen port must be 1-65535"))?;
        if listen_port == 0 {
            return Err(invalid("listen port must be 1-65535"));
        }

        let (target, transport) = match target.rsplit_once('/') {
            Some((t, "tcp")) => (t, Transport::Tcp),
            Some((t, "udp")) => (t, Transport::Udp),
            Some((t, "both")) => (t, Transport::Both),
            Some(_) => return Err(invalid("transport must be tcp, udp or both")),
            None => (target, Transport::Tcp),
        };

        let (host, port) = target
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("backend must be host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("backend host is empty"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| invalid("backend port must be 1-65535"))?;
        if port == 0 {
            return Err(invalid("backend port must be 1-65535"));
        }

        Ok(Self {
            listen_port,
            backend: BackendTarget::new(host, port),
            transport,
        })
    }
}

/// Metrics Sink client settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub base_url: String,
    pub token: String,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub simple_events: bool,
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Forwarded ports, ascending and unique.
    pub routes: Vec<PortRoute>,

    /// IP the public listeners bind to.
    pub bind_ip: IpAddr,

    /// TCP workers per port.
    pub workers_per_port: usize,

    /// Copy buffer size per direction.
    pub buffer_size: usize,

    pub connect_timeout: Duration,
    pub udp_reply_timeout: Duration,
    pub udp_max_inflight: usize,

    pub health_interval: Duration,
    pub health_timeout: Duration,

    pub aggregate_interval: Duration,

    pub sink: SinkConfig,

    /// Monitoring API listen address.
    pub api_addr: SocketAddr,

    /// Bearer token for `/status` and `/metrics`.
    pub api_token: String,

    pub supervisor_poll_interval: Duration,
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let routes_raw = get("TUNNELGATE_ROUTES").ok_or(ConfigError::Missing("TUNNELGATE_ROUTES"))?;
        let mut by_port = BTreeMap::new();
        for entry in routes_raw.split(',').filter(|e| !e.trim().is_empty()) {
            let route: PortRoute = entry.parse()?;
            if by_port.insert(route.listen_port, route.clone()).is_some() {
                return Err(ConfigError::DuplicatePort(route.listen_port));
            }
        }
        if by_port.is_empty() {
            return Err(ConfigError::Invalid {
                var: "TUNNELGATE_ROUTES",
                reason: "no routes configured".to_string(),
            });
        }
        let routes: Vec<PortRoute> = by_port.into_values().collect();

        let bind_ip = parse_or(&get, "TUNNELGATE_BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?;
        let workers_per_port = ranged(&get, "TUNNELGATE_WORKERS", DEFAULT_WORKERS, 1, 256)?;
        let buffer_size = ranged(
            &get,
            "TUNNELGATE_BUFFER_SIZE",
            DEFAULT_BUFFER_SIZE,
            1024,
            16 * 1024 * 1024,
        )?;

        let connect_timeout = millis(&get, "TUNNELGATE_CONNECT_TIMEOUT_MS", 5_000)?;
        let udp_reply_timeout = millis(&get, "TUNNELGATE_UDP_TIMEOUT_MS", 30)?;
        let udp_max_inflight = ranged(&get, "TUNNELGATE_UDP_MAX_INFLIGHT", 1024, 1, 65_536)?;

        let health_interval = secs(&get, "TUNNELGATE_HEALTH_INTERVAL_SECS", 10)?;
        let health_timeout = millis(&get, "TUNNELGATE_HEALTH_TIMEOUT_MS", 3_000)?;
        let aggregate_interval = secs(&get, "TUNNELGATE_AGGREGATE_INTERVAL_SECS", 30)?;

        let base_url =
            get("TUNNELGATE_SINK_URL").ok_or(ConfigError::Missing("TUNNELGATE_SINK_URL"))?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                var: "TUNNELGATE_SINK_URL",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        let token =
            get("TUNNELGATE_SINK_TOKEN").ok_or(ConfigError::Missing("TUNNELGATE_SINK_TOKEN"))?;
        let sink = SinkConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.clone(),
            concurrency: ranged(&get, "TUNNELGATE_SINK_CONCURRENCY", 8, 1, 256)?,
            request_timeout: millis(&get, "TUNNELGATE_SINK_TIMEOUT_MS", 5_000)?,
            simple_events: flag(&get, "TUNNELGATE_SINK_SIMPLE_EVENTS")?,
        };

        let api_addr = parse_or(
            &get,
            "TUNNELGATE_API_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 9090)),
        )?;
        let api_token = get("TUNNELGATE_API_TOKEN").unwrap_or(token);

        let supervisor_poll_interval = secs(&get, "TUNNELGATE_SUPERVISOR_POLL_SECS", 5)?;
        let shutdown_grace = secs(&get, "TUNNELGATE_SHUTDOWN_GRACE_SECS", 10)?;

        let log_level = get("TUNNELGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            routes,
            bind_ip,
            workers_per_port,
            buffer_size,
            connect_timeout,
            udp_reply_timeout,
            udp_max_inflight,
            health_interval,
            health_timeout,
            aggregate_interval,
            sink,
            api_addr,
            api_token,
            supervisor_poll_interval,
            shutdown_grace,
            log_level,
        })
    }

    pub fn tcp_routes(&self) -> impl Iterator<Item = &PortRoute> {
        self.routes.iter().filter(|r| r.transport.tcp())
    }

    pub fn udp_routes(&self) -> impl Iterator<Item = &PortRoute> {
        self.routes.iter().filter(|r| r.transport.udp())
    }
}

fn parse_or<G, T>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match get(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn ranged<G>(
    get: &G,
    var: &'static str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: usize = parse_or(get, var, default)?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid {
            var,
            reason: format!("must be between {min} and {max}"),
        });
    }
    Ok(value)
}

fn millis<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(value))
}

fn secs<G>(get: &G, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, var, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn flag<G>(get: &G, var: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var).map(|v| v.to_lowercase()) {
        None => Ok(false),
        Some(v) if v == "1" || v == "true" => Ok(true),
        Some(v) if v == "0" || v == "false" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            var,
            reason: format!("expected true/false, got '{v}'"),
        }),
    }
}
