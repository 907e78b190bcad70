// ABOUTME: Multi-source configuration document and relay-wide runtime settings
// ABOUTME: Loads JSON or TOML by file extension and validates each source

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineConfig;

pub const DEFAULT_MYSQL_PORT: u16 = 3306;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("source '{source_name}': host must not be empty")]
    MissingHost { source_name: String },
    #[error("source '{source_name}': database name must not be empty")]
    MissingDatabase { source_name: String },
    #[error("source name must not be empty")]
    EmptySourceName,
    #[error("unsupported config format '{0}' (expected .json or .toml)")]
    UnsupportedFormat(String),
}

/// Top-level sources document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub sources: BTreeMap<String, SourceInfo>,
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub initial_load: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub dbname: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

fn default_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

impl fmt::Debug for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceInfo")
            .field("disabled", &self.disabled)
            .field("initial_load", &self.initial_load)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("tables", &self.tables)
            .finish()
    }
}

impl SourceInfo {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::EmptySourceName);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost {
                source_name: name.to_string(),
            });
        }
        if self.dbname.trim().is_empty() {
            return Err(ConfigError::MissingDatabase {
                source_name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TableConfig {
    #[serde(default)]
    pub events: TableEvents,
}

/// Event names per operation. An empty name means the operation is not routed.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TableEvents {
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub create: String,
    #[serde(default)]
    pub update: String,
    #[serde(default)]
    pub delete: String,
}

impl SourcesConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sources file {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = match extension.as_str() {
            "json" => Self::from_json(&text),
            "toml" => Self::from_toml(&text),
            other => Err(ConfigError::UnsupportedFormat(other.to_string()).into()),
        };
        config.with_context(|| format!("Failed to parse sources file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Enabled sources in name order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &SourceInfo)> {
        self.sources.iter().filter(|(_, info)| !info.disabled)
    }
}

/// Relay-wide knobs shared by every source.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub pipeline: PipelineConfig,
    pub publish_batch_size: usize,
    /// Publishes per second; 0 disables limiting.
    pub rate_limit: f64,
    pub rate_burst: Option<u32>,
    pub ack_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub reconnect_interval: Duration,
    pub retry_backoff: Duration,
    /// One SQLite file per source lives here; `None` runs without checkpoints.
    pub store_dir: Option<PathBuf>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            publish_batch_size: 1000,
            rate_limit: 0.0,
            rate_burst: None,
            ack_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
            store_dir: default_store_dir(),
        }
    }
}

/// `~/.cdc-relay/store`, when a home directory can be found.
pub fn default_store_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cdc-relay").join("store"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "sources": {
            "src1": {
                "initialLoad": true,
                "host": "db1.internal",
                "username": "relay",
                "password": "hunter2",
                "dbname": "shop",
                "tables": {
                    "orders": {"events": {"create": "orders.created", "update": "orders.updated"}},
                    "customers": {"events": {"snapshot": "customers.snapshot"}}
                }
            },
            "legacy": {"disabled": true, "host": "old", "dbname": "shop"}
        }
    }"#;

    #[test]
    fn parses_json_document() {
        let config = SourcesConfig::from_json(JSON).unwrap();
        let src1 = &config.sources["src1"];
        assert!(src1.initial_load);
        assert_eq!(src1.port, 3306);
        assert_eq!(src1.tables["orders"].events.create, "orders.created");
        assert_eq!(src1.tables["orders"].events.delete, "");
        let enabled: Vec<_> = config.enabled().map(|(name, _)| name.as_str()).collect();
        assert_eq!(enabled, vec!["src1"]);
    }

    #[test]
    fn parses_toml_document() {
        let text = r#"
            [sources.src1]
            host = "db1.internal"
            port = 3307
            dbname = "shop"

            [sources.src1.tables.orders.events]
            delete = "orders.deleted"
        "#;
        let config = SourcesConfig::from_toml(text).unwrap();
        let src1 = &config.sources["src1"];
        assert_eq!(src1.port, 3307);
        assert!(!src1.initial_load);
        assert_eq!(src1.tables["orders"].events.delete, "orders.deleted");
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("sources.json");
        std::fs::write(&json, JSON).unwrap();
        assert_eq!(SourcesConfig::load(&json).unwrap().sources.len(), 2);

        let yaml = dir.path().join("sources.yaml");
        std::fs::write(&yaml, "sources: {}").unwrap();
        assert!(SourcesConfig::load(&yaml).is_err());
    }

    #[test]
    fn validation_requires_host_and_database() {
        let config = SourcesConfig::from_json(JSON).unwrap();
        assert!(config.sources["src1"].validate("src1").is_ok());

        let mut info = config.sources["src1"].clone();
        info.host.clear();
        assert_eq!(
            info.validate("src1"),
            Err(ConfigError::MissingHost {
                source_name: "src1".into()
            })
        );
        info.host = "db".into();
        info.dbname = " ".into();
        assert!(matches!(
            info.validate("src1"),
            Err(ConfigError::MissingDatabase { .. })
        ));
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = SourcesConfig::from_json(JSON).unwrap();
        let rendered = format!("{:?}", config.sources["src1"]);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
