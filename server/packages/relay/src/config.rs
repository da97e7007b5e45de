//! Environment-supplied configuration, read once at startup. Changing any
//! value requires a restart.

use std::env;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use edge_relay_broker::BrokerConfig;

use crate::runtime::{ClaudeConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;
const DEFAULT_BROKER_PORT: u16 = 4222;
const DEFAULT_CURRENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COLLECT_GAP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COLLECT_OVERALL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Which agent runtime serves queries. `Unconfigured` keeps the server up
/// with querying rejected (503), so the catalog-independent endpoints still
/// work while credentials are being sorted out.
#[derive(Debug, Clone)]
pub enum RuntimeSelection {
    Claude(ClaudeConfig),
    Mock,
    Unconfigured { reason: String },
}

impl RuntimeSelection {
    pub fn model_id(&self) -> String {
        match self {
            Self::Claude(config) => config.model.clone(),
            Self::Mock => "mock-model".to_string(),
            Self::Unconfigured { .. } => String::new(),
        }
    }
}

/// Time-series store connection parameters. Only described to remote
/// clients via `/v1/client-config`; the relay itself never queries it.
#[derive(Debug, Clone, Default)]
pub struct TimeseriesConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub broker: BrokerConfig,
    pub timeseries: TimeseriesConfig,
    pub edge_url: String,
    pub runtime: RuntimeSelection,
    pub history_limit: usize,
    pub current_timeout: Duration,
    pub collect_gap_timeout: Duration,
    pub collect_overall_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or("RELAY_HOST", DEFAULT_HOST);
        let port = parse_var("RELAY_PORT", DEFAULT_PORT)?;

        let broker = BrokerConfig {
            host: env_or("BROKER_HOST", DEFAULT_HOST),
            port: parse_var("BROKER_PORT", DEFAULT_BROKER_PORT)?,
            username: non_empty_var("BROKER_USER"),
            password: non_empty_var("BROKER_PASSWORD"),
        };

        let runtime = match env_or("RELAY_RUNTIME", "claude").as_str() {
            "mock" => RuntimeSelection::Mock,
            _ => match non_empty_var("ANTHROPIC_API_KEY") {
                Some(api_key) => {
                    let mut config = ClaudeConfig::new(api_key);
                    config.base_url = env_or("ANTHROPIC_BASE_URL", DEFAULT_BASE_URL);
                    config.model = env_or("PREFERRED_MODEL_ID", DEFAULT_MODEL);
                    RuntimeSelection::Claude(config)
                }
                None => RuntimeSelection::Unconfigured {
                    reason: "ANTHROPIC_API_KEY is not set".to_string(),
                },
            },
        };

        let timeseries = TimeseriesConfig {
            host: non_empty_var("INFLUX_HOST"),
            port: match non_empty_var("INFLUX_PORT") {
                Some(value) => Some(value.parse().map_err(|_| ConfigError::Invalid {
                    key: "INFLUX_PORT",
                    value,
                })?),
                None => None,
            },
            database: non_empty_var("INFLUX_DB_NAME"),
            username: non_empty_var("INFLUX_USERNAME"),
            password: non_empty_var("INFLUX_PASSWORD"),
        };

        Ok(Self {
            host,
            port,
            broker,
            timeseries,
            edge_url: env_or("EDGE_URL", ""),
            runtime,
            history_limit: parse_var("RELAY_HISTORY_LIMIT", crate::session::DEFAULT_HISTORY_LIMIT)?,
            current_timeout: Duration::from_secs(parse_var(
                "RELAY_CURRENT_TIMEOUT_SECS",
                DEFAULT_CURRENT_TIMEOUT_SECS,
            )?),
            collect_gap_timeout: Duration::from_secs(parse_var(
                "RELAY_COLLECT_GAP_TIMEOUT_SECS",
                DEFAULT_COLLECT_GAP_TIMEOUT_SECS,
            )?),
            collect_overall_timeout: Duration::from_secs(parse_var(
                "RELAY_COLLECT_OVERALL_TIMEOUT_SECS",
                DEFAULT_COLLECT_OVERALL_TIMEOUT_SECS,
            )?),
        })
    }

    /// The connection-parameter document served by `/v1/client-config`.
    /// Purely descriptive; credentials appear as placeholders, never echoed.
    pub fn client_config_document(&self) -> ClientConfigDocument {
        ClientConfigDocument {
            broker: BrokerSection {
                host: self.broker.host.clone(),
                port: self.broker.port,
                username: self.broker.username.as_ref().map(|_| "${BROKER_USER}".to_string()),
                password: self
                    .broker
                    .password
                    .as_ref()
                    .map(|_| "${BROKER_PASSWORD}".to_string()),
            },
            timeseries: self.timeseries.host.as_ref().map(|host| TimeseriesSection {
                host: host.clone(),
                port: self.timeseries.port,
                database: self.timeseries.database.clone(),
                username: self
                    .timeseries
                    .username
                    .as_ref()
                    .map(|_| "${INFLUX_USERNAME}".to_string()),
                password: self
                    .timeseries
                    .password
                    .as_ref()
                    .map(|_| "${INFLUX_PASSWORD}".to_string()),
            }),
            edge_url: self.edge_url.clone(),
            model_id: self.runtime.model_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigDocument {
    pub broker: BrokerSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeseries: Option<TimeseriesSection>,
    pub edge_url: String,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TimeseriesSection {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => {
            value.parse().map_err(|_| ConfigError::Invalid { key, value })
        }
        _ => Ok(default),
    }
}
