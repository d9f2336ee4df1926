//! Daemon configuration.
//!
//! Loaded from an optional TOML file over library defaults. The file
//! declares the socket paths, the queue capacities, and the instance
//! registry: which sensor, chain and adaptor ids exist and which factory
//! type backs each one. Instances themselves are never configured here;
//! they are built on demand by the manager.
//!
//! ```toml
//! socket_path = "/tmp/sensord.sock"
//!
//! [[adaptors]]
//! id = "acceladaptor"
//! type = "mockadaptor"
//! [adaptors.properties]
//! interval = 100
//!
//! [[chains]]
//! id = "accelchain"
//! type = "mockchain"
//!
//! [[sensors]]
//! id = "accel"
//! type = "mocksensor"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::Config;
use serde::{Deserialize, Serialize};

/// One declared sensor or chain id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDecl {
    pub id: String,
    /// Factory type name (must match a registered factory).
    #[serde(rename = "type")]
    pub type_name: String,
}

/// One declared adaptor id with its construction property map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptorDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    /// Sample stream socket; fixed absolute path, world-accessible.
    pub socket_path: PathBuf,
    /// Control request socket.
    pub control_socket_path: PathBuf,
    /// Sample pump queue capacity.
    pub pump_capacity: usize,
    pub command_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub sensors: Vec<ObjectDecl>,
    pub chains: Vec<ObjectDecl>,
    pub adaptors: Vec<AdaptorDecl>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: PathBuf::from("/tmp/sensord.sock"),
            control_socket_path: PathBuf::from("/tmp/sensord-control.sock"),
            pump_capacity: 128,
            command_channel_capacity: 32,
            event_channel_capacity: 32,
            sensors: Vec::new(),
            chains: Vec::new(),
            adaptors: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` over the defaults and validates them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default()).context("default settings")?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings: Settings = builder
            .build()
            .context("failed to load configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !self.socket_path.is_absolute() {
            bail!("socket_path must be absolute: {}", self.socket_path.display());
        }
        if !self.control_socket_path.is_absolute() {
            bail!(
                "control_socket_path must be absolute: {}",
                self.control_socket_path.display()
            );
        }
        if self.socket_path == self.control_socket_path {
            bail!("socket_path and control_socket_path must differ");
        }
        if self.pump_capacity == 0 {
            bail!("pump_capacity must be positive");
        }
        if self.command_channel_capacity == 0 || self.event_channel_capacity == 0 {
            bail!("channel capacities must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for (kind, id) in self
            .sensors
            .iter()
            .map(|decl| ("sensor", &decl.id))
            .chain(self.chains.iter().map(|decl| ("chain", &decl.id)))
            .chain(self.adaptors.iter().map(|decl| ("adaptor", &decl.id)))
        {
            if id.is_empty() {
                bail!("empty {kind} id");
            }
            if id.contains(';') {
                bail!("{kind} id '{id}' must not contain ';'");
            }
            if !seen.insert(id.clone()) {
                bail!("duplicate id '{id}'");
            }
        }
        Ok(())
    }
}
