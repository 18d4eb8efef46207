//! Relay configuration.
//!
//! Defaults suit a local docker-compose style deployment; every field can be
//! overridden through an environment variable.

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::store::SourceCapabilities;

/// Which backing stores feed ticks, robots and order aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProfile {
    /// Ticks and robot rows arrive together on the `world:state` stream.
    Stream,
    /// `WORLD_T` notifications; robots read from `robot:<id>` hashes.
    Channel,
    /// `WORLD_T` notifications; robots and orders read from the snapshot database.
    Sqlite,
}

impl RelayProfile {
    pub fn capabilities(self) -> SourceCapabilities {
        match self {
            RelayProfile::Stream => {
                SourceCapabilities::TICK_STREAM | SourceCapabilities::ORDERS_FROM_PUBSUB
            }
            RelayProfile::Channel => {
                SourceCapabilities::TICK_CHANNEL
                    | SourceCapabilities::ROBOTS_FROM_HASHES
                    | SourceCapabilities::ORDERS_FROM_PUBSUB
            }
            RelayProfile::Sqlite => {
                SourceCapabilities::TICK_CHANNEL
                    | SourceCapabilities::ROBOTS_FROM_SNAPSHOT
                    | SourceCapabilities::ORDERS_FROM_SNAPSHOT
                    | SourceCapabilities::DT_FROM_SNAPSHOT
            }
        }
    }
}

impl FromStr for RelayProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(RelayProfile::Stream),
            "channel" => Ok(RelayProfile::Channel),
            "sqlite" | "snapshot" => Ok(RelayProfile::Sqlite),
            other => Err(format!("unknown relay profile `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub world_db_path: PathBuf,
    pub pubsub_host: String,
    pub pubsub_port: u16,
    pub cache_duration: Duration,
    pub warehouse_path: PathBuf,
    pub item_names_path: Option<PathBuf>,
    pub aggregation_interval: Duration,
    pub store_retry: Duration,
    pub order_list_limit: usize,
    pub profile: RelayProfile,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
            world_db_path: PathBuf::from("/data/world.db"),
            pubsub_host: "localhost".to_string(),
            pubsub_port: 6379,
            cache_duration: Duration::from_millis(1500),
            warehouse_path: PathBuf::from("./warehouses/warehouse3.json"),
            item_names_path: None,
            aggregation_interval: Duration::from_millis(1000),
            store_retry: Duration::from_secs(5),
            order_list_limit: 10,
            profile: RelayProfile::Stream,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::default();

        let host: IpAddr = parse_or(&lookup, "BIND_HOST", config.bind.ip())?;
        let port: u16 = parse_or(&lookup, "PORT", config.bind.port())?;
        config.bind = SocketAddr::new(host, port);

        if let Some(path) = non_empty(&lookup, "WORLD_DB_PATH") {
            config.world_db_path = PathBuf::from(path);
        }
        if let Some(host) = non_empty(&lookup, "REDIS_HOST") {
            config.pubsub_host = host;
        }
        config.pubsub_port = parse_or(&lookup, "REDIS_PORT", config.pubsub_port)?;

        let cache_ms: u64 = parse_or(
            &lookup,
            "CACHE_DURATION_MS",
            config.cache_duration.as_millis() as u64,
        )?;
        config.cache_duration = Duration::from_millis(cache_ms);

        if let Some(path) = non_empty(&lookup, "WAREHOUSE_PATH") {
            config.warehouse_path = PathBuf::from(path);
        }
        config.item_names_path = non_empty(&lookup, "ITEM_NAMES_PATH").map(PathBuf::from);

        let aggregation_ms: u64 = parse_or(
            &lookup,
            "AGGREGATION_INTERVAL_MS",
            config.aggregation_interval.as_millis() as u64,
        )?;
        if aggregation_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "AGGREGATION_INTERVAL_MS",
                value: "0".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }
        config.aggregation_interval = Duration::from_millis(aggregation_ms);

        let retry_secs: u64 =
            parse_or(&lookup, "STORE_RETRY_SECS", config.store_retry.as_secs())?;
        config.store_retry = Duration::from_secs(retry_secs.max(1));

        config.order_list_limit = parse_or(&lookup, "ORDER_LIST_LIMIT", config.order_list_limit)?;

        if let Some(raw) = non_empty(&lookup, "RELAY_PROFILE") {
            config.profile = raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "RELAY_PROFILE",
                value: raw.clone(),
                reason,
            })?;
        }

        Ok(config)
    }

    pub fn pubsub_url(&self) -> String {
        format!("redis://{}:{}/", self.pubsub_host, self.pubsub_port)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}
