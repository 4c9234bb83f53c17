use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

/// How the conversation layer picks a target turn when several candidates qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    #[default]
    MostRecent,
    RequireExplicit,
}

impl FromStr for AmbiguityPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "most_recent" => Ok(AmbiguityPolicy::MostRecent),
            "require_explicit" => Ok(AmbiguityPolicy::RequireExplicit),
            other => anyhow::bail!(
                "invalid PAYQUERY_AMBIGUITY_POLICY '{other}' (use most_recent|require_explicit)"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    /// DSN of the least-privilege role used for freeform SQL.
    pub readonly_database_url: String,
    pub max_pool_size: u32,
    pub readonly_max_pool_size: u32,
    pub api_key: Option<String>,
    pub default_limit: i64,
    pub max_limit: i64,
    pub freeform_max_limit: i64,
    pub request_timeout: Duration,
    pub cursor_ttl: Duration,
    pub cursor_capacity: usize,
    pub ambiguity_policy: AmbiguityPolicy,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    payquery_listen_addr: Option<String>,
    #[serde(default)]
    payquery_listen_host: Option<String>,
    #[serde(default)]
    payquery_listen_port: Option<u16>,
    #[serde(default)]
    payquery_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    payquery_readonly_database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    payquery_max_pool_size: u32,
    #[serde(default = "default_readonly_pool_size")]
    payquery_readonly_max_pool_size: u32,
    #[serde(default)]
    payquery_api_key: Option<String>,
    #[serde(default = "default_limit")]
    payquery_default_limit: i64,
    #[serde(default = "default_max_limit")]
    payquery_max_limit: i64,
    #[serde(default = "default_freeform_max_limit")]
    payquery_freeform_max_limit: i64,
    #[serde(default = "default_timeout_secs")]
    payquery_request_timeout_secs: u64,
    #[serde(default = "default_cursor_ttl_secs")]
    payquery_cursor_ttl_secs: u64,
    #[serde(default = "default_cursor_capacity")]
    payquery_cursor_capacity: usize,
    #[serde(default)]
    payquery_ambiguity_policy: Option<String>,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_readonly_pool_size() -> u32 {
    2
}

const fn default_limit() -> i64 {
    20
}

const fn default_max_limit() -> i64 {
    1000
}

const fn default_freeform_max_limit() -> i64 {
    500
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_cursor_ttl_secs() -> u64 {
    1800
}

const fn default_cursor_capacity() -> usize {
    10_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse PAYQUERY_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.payquery_listen_addr,
            raw.payquery_listen_host,
            raw.payquery_listen_port,
        )?;

        let database_url = raw
            .payquery_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("PAYQUERY_DATABASE_URL or DATABASE_URL must be set")?;

        let ambiguity_policy = raw
            .payquery_ambiguity_policy
            .as_deref()
            .map(AmbiguityPolicy::from_str)
            .transpose()?
            .unwrap_or_default();

        let default_limit = raw.payquery_default_limit.max(1);

        Ok(Self {
            listen_addr,
            readonly_database_url: raw
                .payquery_readonly_database_url
                .unwrap_or_else(|| database_url.clone()),
            database_url,
            max_pool_size: raw.payquery_max_pool_size.max(1),
            readonly_max_pool_size: raw.payquery_readonly_max_pool_size.max(1),
            api_key: raw.payquery_api_key.filter(|key| !key.is_empty()),
            default_limit,
            max_limit: raw.payquery_max_limit.max(default_limit),
            freeform_max_limit: raw.payquery_freeform_max_limit.max(1),
            request_timeout: Duration::from_secs(raw.payquery_request_timeout_secs.max(1)),
            cursor_ttl: Duration::from_secs(raw.payquery_cursor_ttl_secs.max(1)),
            cursor_capacity: raw.payquery_cursor_capacity.max(1),
            ambiguity_policy,
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
        })
    }

    /// Defaults for embedding the engine or driving it from tests.
    pub fn embedded(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            readonly_database_url: database_url.clone(),
            database_url,
            max_pool_size: default_pool_size(),
            readonly_max_pool_size: default_readonly_pool_size(),
            api_key: None,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            freeform_max_limit: default_freeform_max_limit(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
            cursor_ttl: Duration::from_secs(default_cursor_ttl_secs()),
            cursor_capacity: default_cursor_capacity(),
            ambiguity_policy: AmbiguityPolicy::default(),
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid PAYQUERY_LISTEN_ADDR value")?
            .next()
            .context("PAYQUERY_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid payquery listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ambiguity_policy() {
        assert_eq!(
            "require-explicit".parse::<AmbiguityPolicy>().unwrap(),
            AmbiguityPolicy::RequireExplicit
        );
        assert_eq!(
            " MOST_RECENT ".parse::<AmbiguityPolicy>().unwrap(),
            AmbiguityPolicy::MostRecent
        );
        assert!("guess".parse::<AmbiguityPolicy>().is_err());
    }

    #[test]
    fn embedded_config_uses_defaults() {
        let config = AppConfig::embedded("postgres://localhost/payments");
        assert_eq!(config.default_limit, 20);
        assert_eq!(config.max_limit, 1000);
        assert_eq!(config.freeform_max_limit, 500);
        assert_eq!(config.readonly_database_url, config.database_url);
        assert_eq!(config.ambiguity_policy, AmbiguityPolicy::MostRecent);
    }

    #[test]
    fn resolves_host_and_port() {
        let addr = resolve_addr(None, Some("127.0.0.1".into()), Some(9000)).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        let default = resolve_addr(None, None, None).unwrap();
        assert_eq!(default.port(), 8490);
    }
}
