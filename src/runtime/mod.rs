//! Client runtime
//!
//! The boot sequence: resolve both config records from one flat source,
//! request combiner assignment when no host is pre-pinned, build the
//! channel, then hand the user's callbacks to the task engine and run.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::channel::{self, ChannelError, CombinerChannel};
use crate::config::{
    load_config_map, CombinerConfig, ConfigError, ConfigMap, ControllerConfig,
};
use crate::discovery::{AssignmentError, DiscoveryClient};
use crate::engine::handler::TaskHandler;
use crate::engine::{ClientIdentity, EngineError, TaskEngine};

/// Top-level client errors. Config, assignment and channel errors are
/// fatal to startup; an engine error means the run loop has ended.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A configured FEDn client.
pub struct FednClient {
    controller: ControllerConfig,
    combiner: CombinerConfig,
}

impl FednClient {
    /// Resolve the client from a flat TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let map = load_config_map(path)?;
        Self::from_config_map(&map)
    }

    /// Resolve the client from an already loaded flat config map.
    pub fn from_config_map(map: &ConfigMap) -> Result<Self, ClientError> {
        Ok(Self {
            controller: ControllerConfig::resolve(map)?,
            combiner: CombinerConfig::resolve(map)?,
        })
    }

    pub fn controller_config(&self) -> &ControllerConfig {
        &self.controller
    }

    pub fn combiner_config(&self) -> &CombinerConfig {
        &self.combiner
    }

    /// Make sure a combiner endpoint is known, requesting assignment from
    /// the control plane when none is pre-pinned.
    pub async fn ensure_assignment(&mut self) -> Result<&CombinerConfig, ClientError> {
        if !self.combiner.is_assigned() {
            let discovery = DiscoveryClient::new(&self.controller)?;
            info!(api_url = %discovery.api_url(), "Requesting combiner assignment");
            let assignment = discovery.assign(&self.controller).await?;
            self.combiner.apply_assignment(
                &assignment.host,
                assignment.fqdn.as_deref(),
                assignment.port,
            );
            info!(
                host = %self.combiner.host,
                proxy = ?self.combiner.proxy_host,
                "Assigned to combiner"
            );
        }
        Ok(&self.combiner)
    }

    /// Build the combiner channel for the current combiner config.
    pub fn build_channel(&self) -> Result<CombinerChannel, ClientError> {
        Ok(channel::build(&self.combiner)?)
    }

    /// Construct a task engine over `channel` with the given callbacks.
    pub fn engine(&self, channel: &CombinerChannel, handler: Arc<dyn TaskHandler>) -> TaskEngine {
        let identity = ClientIdentity::new(
            self.controller.name.clone(),
            self.controller.client_id.clone(),
        );
        TaskEngine::new(channel, identity, handler)
    }

    /// Full client run: assignment (if needed), channel build, task loop.
    /// Blocks until the task stream ends or the channel becomes
    /// unavailable.
    pub async fn run(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), ClientError> {
        self.ensure_assignment().await?;
        let channel = self.build_channel()?;
        info!(
            dial_target = %channel.dial_target,
            insecure = self.combiner.insecure,
            "Combiner channel ready"
        );
        let engine = self.engine(&channel, handler);
        engine.run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinned_map() -> ConfigMap {
        let mut map = ConfigMap::new();
        map.insert("discover_host".into(), "api.fedn.example".into());
        map.insert("client_id".into(), "c1".into());
        map.insert("name".into(), "alpha".into());
        map.insert("combiner".into(), "cmb1:7777".into());
        map.insert("insecure".into(), "true".into());
        map
    }

    #[tokio::test]
    async fn pre_pinned_combiner_skips_assignment() {
        let mut client = FednClient::from_config_map(&pinned_map()).unwrap();
        let combiner = client.ensure_assignment().await.unwrap();
        assert_eq!(combiner.host, "cmb1:7777");
    }

    #[tokio::test]
    async fn channel_builds_from_pinned_config() {
        let client = FednClient::from_config_map(&pinned_map()).unwrap();
        let channel = client.build_channel().unwrap();
        assert_eq!(channel.dial_target, "cmb1:7777");
        assert!(channel.credentials.is_empty());
    }
}
