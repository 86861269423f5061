//! Environment-driven configuration.
//!
//! All knobs come from the environment (or a `.env` file in
//! development); there is no dynamic reconfiguration at runtime.
//! Upstream host:port specs are resolved once at startup so a typo in a
//! service name fails the process immediately instead of per-request.

use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};

use crate::proxy::RateLimit;

/// One configured upstream replica.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// The configured `host:port` spec.
    pub host: String,
    /// Resolved socket address.
    pub addr: SocketAddr,
}

/// Where the rate-limit client key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKeySource {
    /// Remote peer IP (default).
    RemoteAddr,
    /// Leftmost `X-Forwarded-For` hop, for deployments behind another
    /// proxy.
    ForwardedFor,
}

impl FromStr for ClientKeySource {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "remote-addr" => Ok(Self::RemoteAddr),
            "forwarded-for" => Ok(Self::ForwardedFor),
            other => bail!("unknown client key source {other:?} (expected remote-addr or forwarded-for)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Client-facing listener, `host:port`.
    pub listen_addr: String,
    /// Kubernetes probe sidecar listener.
    pub probe_addr: SocketAddr,

    pub frontend_upstreams: Vec<UpstreamConfig>,
    pub planner_upstreams: Vec<UpstreamConfig>,
    pub monitoring_upstreams: Vec<UpstreamConfig>,

    /// Consecutive failures within the window before a replica is ejected.
    pub max_fails: u32,
    /// Rolling failure window, also the ejection duration.
    pub fail_timeout: Duration,

    pub api_rate: RateLimit,
    pub frontend_rate: RateLimit,
    pub client_key_source: ClientKeySource,

    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Wide to accommodate long-running generation requests.
    pub read_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_rate = RateLimit {
            rate: api_rate_per_second()?,
            burst: env_parse("API_RATE_BURST", 20u32)?,
        };
        let frontend_rate = RateLimit {
            rate: env_parse("FRONTEND_RATE_LIMIT", 30.0f64)?,
            burst: env_parse("FRONTEND_RATE_BURST", 10u32)?,
        };
        ensure!(api_rate.rate > 0.0, "api rate limit must be positive");
        ensure!(frontend_rate.rate > 0.0, "frontend rate limit must be positive");

        Ok(Self {
            listen_addr: env_string("LISTEN_ADDR", "0.0.0.0:80"),
            probe_addr: env_parse("PROBE_ADDR", "0.0.0.0:9090".parse::<SocketAddr>()?)?,
            frontend_upstreams: resolve_class("FRONTEND_UPSTREAMS", "frontend-service:8501")?,
            planner_upstreams: resolve_class("PLANNER_UPSTREAMS", "planner-service:8000")?,
            monitoring_upstreams: resolve_class("MONITORING_UPSTREAMS", "monitoring-service:8002")?,
            max_fails: env_parse("MAX_FAILS", 3u32)?,
            fail_timeout: Duration::from_secs(env_parse("FAIL_TIMEOUT_SECS", 30u64)?),
            api_rate,
            frontend_rate,
            client_key_source: env_parse("CLIENT_KEY_SOURCE", ClientKeySource::RemoteAddr)?,
            connect_timeout: Duration::from_secs(env_parse("CONNECT_TIMEOUT_SECS", 60u64)?),
            send_timeout: Duration::from_secs(env_parse("SEND_TIMEOUT_SECS", 60u64)?),
            read_timeout: Duration::from_secs(env_parse("READ_TIMEOUT_SECS", 300u64)?),
        })
    }
}

/// The api-class refill rate, overridable as `RATE_LIMIT_REQUESTS` per
/// `RATE_LIMIT_WINDOW` seconds (the settings surface the rest of the
/// platform uses), falling back to `API_RATE_LIMIT` requests/second.
fn api_rate_per_second() -> Result<f64> {
    match (env_var("RATE_LIMIT_REQUESTS"), env_var("RATE_LIMIT_WINDOW")) {
        (Some(requests), Some(window)) => {
            let requests: f64 = requests
                .parse()
                .with_context(|| format!("invalid RATE_LIMIT_REQUESTS: {requests}"))?;
            let window: f64 = window
                .parse()
                .with_context(|| format!("invalid RATE_LIMIT_WINDOW: {window}"))?;
            ensure!(window > 0.0, "RATE_LIMIT_WINDOW must be positive");
            Ok(requests / window)
        }
        _ => env_parse("API_RATE_LIMIT", 10.0f64),
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    anyhow::Error: From<T::Err>,
{
    match env_var(key) {
        Some(raw) => T::from_str(&raw)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}

/// Splits a comma-separated upstream list into individual specs.
fn parse_upstream_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(String::from)
        .collect()
}

/// Resolves one `host:port` spec to a socket address.
fn resolve_upstream(spec: &str) -> Result<UpstreamConfig> {
    let addr = spec
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve upstream {spec:?}"))?
        .next()
        .with_context(|| format!("upstream {spec:?} resolved to no addresses"))?;
    Ok(UpstreamConfig {
        host: spec.to_string(),
        addr,
    })
}

fn resolve_class(key: &str, default: &str) -> Result<Vec<UpstreamConfig>> {
    let specs = parse_upstream_list(&env_string(key, default));
    ensure!(!specs.is_empty(), "{key} must name at least one replica");
    specs.iter().map(|spec| resolve_upstream(spec)).collect()
}
