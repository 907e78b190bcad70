// ABOUTME: Starts and stops one orchestrator per enabled source
// ABOUTME: Fail-fast startup in name order through a pluggable connector

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{RelaySettings, SourceInfo, SourcesConfig};
use crate::source::{SourceDeps, SourceOrchestrator};

/// Builds the external collaborators of a source.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, info: &SourceInfo) -> Result<SourceDeps>;
}

pub struct SourceManager {
    settings: RelaySettings,
    connector: Arc<dyn Connector>,
    sources: Vec<SourceOrchestrator>,
}

impl SourceManager {
    pub fn new(settings: RelaySettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            sources: Vec::new(),
        }
    }

    /// Names of the running sources, in start order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// Starts every enabled source in name order. If any source fails, the
    /// ones already started are shut down and the error is returned.
    pub async fn start(&mut self, config: &SourcesConfig) -> Result<()> {
        for (name, info) in &config.sources {
            if info.disabled {
                tracing::info!(source = %name, "source disabled; skipping");
                continue;
            }

            match self.start_source(name, info).await {
                Ok(source) => self.sources.push(source),
                Err(err) => {
                    tracing::error!(source = %name, error = %format!("{err:#}"), "source failed to start");
                    self.shutdown().await;
                    return Err(err).with_context(|| format!("Failed to start source '{}'", name));
                }
            }
        }

        if self.sources.is_empty() {
            tracing::warn!("no enabled sources configured");
        } else {
            tracing::info!(sources = ?self.source_names(), "all sources started");
        }
        Ok(())
    }

    async fn start_source(&self, name: &str, info: &SourceInfo) -> Result<SourceOrchestrator> {
        info.validate(name)?;
        let deps = self.connector.connect(name, info).await?;
        let mut source = SourceOrchestrator::new(name, info.clone(), self.settings.clone(), deps)?;
        source.start().await?;
        Ok(source)
    }

    /// Stops every running source, most recently started first.
    pub async fn shutdown(&mut self) {
        while let Some(mut source) = self.sources.pop() {
            source.shutdown().await;
        }
    }
}
