//! Refcounted chain and adaptor registries.
//!
//! Both kinds share the same lifecycle: an entry is declared up front with a
//! type name, the live instance is built by the registered factory on the
//! first request, every further request bumps the reference count, and the
//! instance is destroyed when the count returns to zero. Adaptors
//! additionally get their declared property map applied before `start_adaptor`
//! and are stopped before destruction.
//!
//! Chain factories receive mutable access to the adaptor registry only, and
//! sensor factories receive the whole [`Pipelines`] value; neither can reach
//! back into the manager facade during construction.

use std::collections::BTreeMap;
use std::collections::HashMap;

use sensord_core::error::{ErrorKind, ManagerError, ManagerResult};
use sensord_core::{idutils, Chain, DeviceAdaptor, Filter, PipelineRef};
use tracing::{debug, warn};

/// Builds a device adaptor for the given id.
pub type AdaptorFactory = fn(&str) -> Box<dyn DeviceAdaptor>;

/// Builds a chain for the given id, acquiring its adaptors from the registry.
pub type ChainFactory = fn(&str, &mut AdaptorRegistry) -> Box<dyn Chain>;

/// Builds a fresh, untracked filter instance.
pub type FilterFactory = fn() -> Box<dyn Filter>;

/// One declared adaptor id: its type, the live instance if any, the number of
/// outstanding requests, and the property map applied at construction.
pub struct AdaptorEntry {
    type_name: String,
    instance: Option<Box<dyn DeviceAdaptor>>,
    refcount: u32,
    properties: HashMap<String, u32>,
}

impl AdaptorEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn is_live(&self) -> bool {
        self.instance.is_some()
    }

    pub fn instance(&self) -> Option<&dyn DeviceAdaptor> {
        self.instance.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, u32> {
        &self.properties
    }
}

struct ChainEntry {
    type_name: String,
    instance: Option<Box<dyn Chain>>,
    refcount: u32,
}

/// Name-keyed adaptor factory and instance tables.
#[derive(Default)]
pub struct AdaptorRegistry {
    factories: HashMap<String, AdaptorFactory>,
    entries: BTreeMap<String, AdaptorEntry>,
}

impl AdaptorRegistry {
    pub fn register_factory(&mut self, type_name: &str, factory: AdaptorFactory) {
        self.factories.insert(type_name.to_string(), factory);
    }

    pub fn has_factory(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Declares an adaptor id. The instance is not built until the first
    /// request.
    pub fn register_adaptor(
        &mut self,
        id: &str,
        type_name: &str,
        properties: HashMap<String, u32>,
    ) {
        assert!(idutils::is_clean(id), "parameterized adaptor id '{id}'");
        let previous = self.entries.insert(
            id.to_string(),
            AdaptorEntry {
                type_name: type_name.to_string(),
                instance: None,
                refcount: 0,
                properties,
            },
        );
        if let Some(previous) = previous {
            assert!(
                !previous.is_live(),
                "adaptor '{id}' re-registered while instantiated"
            );
            warn!(id, "adaptor entry replaced");
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entry(&self, id: &str) -> Option<&AdaptorEntry> {
        self.entries.get(id)
    }

    /// Mutable access to a live instance, for property application and
    /// operational-state fan-out.
    pub fn adaptor_mut(&mut self, id: &str) -> Option<&mut dyn DeviceAdaptor> {
        match self.entries.get_mut(id) {
            Some(entry) => match entry.instance.as_mut() {
                Some(instance) => Some(&mut **instance),
                None => None,
            },
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdaptorEntry)> {
        self.entries.iter()
    }

    /// Iterates the live instances only.
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn DeviceAdaptor>> {
        self.entries
            .values_mut()
            .filter_map(|entry| entry.instance.as_mut())
    }

    /// Takes a reference on the adaptor, building and starting it first if no
    /// instance exists yet.
    pub fn request(&mut self, id: &str) -> ManagerResult<()> {
        debug_assert!(idutils::is_clean(id), "parameterized adaptor id '{id}'");

        let Some(entry) = self.entries.get_mut(id) else {
            return Err(ManagerError::new(
                ErrorKind::IdNotRegistered,
                format!("unknown adaptor id '{id}'"),
            ));
        };

        if entry.instance.is_some() {
            entry.refcount += 1;
            return Ok(());
        }

        let Some(factory) = self.factories.get(&entry.type_name).copied() else {
            return Err(ManagerError::new(
                ErrorKind::FactoryNotRegistered,
                format!("unknown adaptor type '{}'", entry.type_name),
            ));
        };

        debug!(id, "creating adaptor instance");
        let mut adaptor = factory(id);
        for (name, value) in &entry.properties {
            adaptor.set_property(name, *value);
        }

        if !adaptor.start_adaptor() {
            return Err(ManagerError::new(
                ErrorKind::AdaptorNotStarted,
                format!("adaptor '{id}' can not be started"),
            ));
        }

        entry.instance = Some(adaptor);
        entry.refcount += 1;
        Ok(())
    }

    /// Drops a reference; at zero the adaptor is stopped and destroyed.
    pub fn release(&mut self, id: &str) -> ManagerResult<()> {
        debug_assert!(idutils::is_clean(id), "parameterized adaptor id '{id}'");

        let Some(entry) = self.entries.get_mut(id) else {
            return Err(ManagerError::new(
                ErrorKind::IdNotRegistered,
                format!("unknown adaptor id '{id}'"),
            ));
        };

        if entry.instance.is_none() {
            return Err(ManagerError::new(
                ErrorKind::NotInstantiated,
                format!("adaptor '{id}' not instantiated, cannot release"),
            ));
        }

        assert!(entry.refcount > 0, "adaptor '{id}' refcount underflow");
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let mut adaptor = entry.instance.take().expect("instance checked above");
            adaptor.stop_adaptor();
            debug!(id, "adaptor instance destroyed");
        }
        Ok(())
    }
}

/// Chain registry plus the adaptor registry the chains draw from, and the
/// filter factory table.
#[derive(Default)]
pub struct Pipelines {
    chain_factories: HashMap<String, ChainFactory>,
    chain_entries: BTreeMap<String, ChainEntry>,
    filter_factories: HashMap<String, FilterFactory>,
    pub adaptors: AdaptorRegistry,
}

impl Pipelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_chain_factory(&mut self, type_name: &str, factory: ChainFactory) {
        self.chain_factories.insert(type_name.to_string(), factory);
    }

    pub fn has_chain_factory(&self, type_name: &str) -> bool {
        self.chain_factories.contains_key(type_name)
    }

    pub fn register_chain(&mut self, id: &str, type_name: &str) {
        assert!(idutils::is_clean(id), "parameterized chain id '{id}'");
        let previous = self.chain_entries.insert(
            id.to_string(),
            ChainEntry {
                type_name: type_name.to_string(),
                instance: None,
                refcount: 0,
            },
        );
        if let Some(previous) = previous {
            assert!(
                previous.instance.is_none(),
                "chain '{id}' re-registered while instantiated"
            );
            warn!(id, "chain entry replaced");
        }
    }

    pub fn register_filter_factory(&mut self, name: &str, factory: FilterFactory) {
        self.filter_factories.insert(name.to_string(), factory);
    }

    pub fn has_filter_factory(&self, name: &str) -> bool {
        self.filter_factories.contains_key(name)
    }

    pub fn chain_refcount(&self, id: &str) -> Option<u32> {
        self.chain_entries.get(id).map(|entry| entry.refcount)
    }

    pub fn chain_is_live(&self, id: &str) -> bool {
        self.chain_entries
            .get(id)
            .is_some_and(|entry| entry.instance.is_some())
    }

    /// `(type, refcount, running)` rows for the status dump.
    pub fn chain_status(&self) -> impl Iterator<Item = (&String, &str, u32, bool)> {
        self.chain_entries.iter().map(|(id, entry)| {
            let running = entry
                .instance
                .as_ref()
                .is_some_and(|chain| chain.running());
            (id, entry.type_name.as_str(), entry.refcount, running)
        })
    }

    /// Takes a reference on the chain, building it first if no instance
    /// exists yet. Chain construction may acquire adaptors.
    pub fn request_chain(&mut self, id: &str) -> ManagerResult<()> {
        debug_assert!(idutils::is_clean(id), "parameterized chain id '{id}'");

        let Some(entry) = self.chain_entries.get_mut(id) else {
            return Err(ManagerError::new(
                ErrorKind::IdNotRegistered,
                format!("unknown chain id '{id}'"),
            ));
        };

        if entry.instance.is_some() {
            entry.refcount += 1;
            return Ok(());
        }

        let Some(factory) = self.chain_factories.get(&entry.type_name).copied() else {
            return Err(ManagerError::new(
                ErrorKind::FactoryNotRegistered,
                format!("unknown chain type '{}'", entry.type_name),
            ));
        };

        debug!(id, "creating chain instance");
        let chain = factory(id, &mut self.adaptors);
        let entry = self
            .chain_entries
            .get_mut(id)
            .expect("entry present; factories cannot unregister chains");
        entry.instance = Some(chain);
        entry.refcount += 1;
        Ok(())
    }

    /// Drops a reference; at zero the chain is destroyed and the adaptors it
    /// acquired are released.
    pub fn release_chain(&mut self, id: &str) -> ManagerResult<()> {
        debug_assert!(idutils::is_clean(id), "parameterized chain id '{id}'");

        let Some(entry) = self.chain_entries.get_mut(id) else {
            return Err(ManagerError::new(
                ErrorKind::IdNotRegistered,
                format!("unknown chain id '{id}'"),
            ));
        };

        if entry.instance.is_none() {
            return Err(ManagerError::new(
                ErrorKind::NotInstantiated,
                format!("chain '{id}' not instantiated, cannot release"),
            ));
        }

        assert!(entry.refcount > 0, "chain '{id}' refcount underflow");
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let chain = entry.instance.take().expect("instance checked above");
            let dependencies = chain.dependencies().to_vec();
            drop(chain);
            debug!(id, "chain instance destroyed");
            for dependency in dependencies {
                match dependency {
                    PipelineRef::Adaptor(adaptor_id) => {
                        if let Err(err) = self.adaptors.release(&adaptor_id) {
                            warn!(chain = id, adaptor = %adaptor_id, %err, "dependency release failed");
                        }
                    }
                    PipelineRef::Chain(nested) => {
                        if let Err(err) = self.release_chain(&nested) {
                            warn!(chain = id, nested = %nested, %err, "dependency release failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Builds a fresh filter, or `None` with a warning when no factory is
    /// registered under the name. Filters are not tracked.
    pub fn instantiate_filter(&self, name: &str) -> Option<Box<dyn Filter>> {
        match self.filter_factories.get(name) {
            Some(factory) => Some(factory()),
            None => {
                warn!(name, "filter not found");
                None
            }
        }
    }
}
