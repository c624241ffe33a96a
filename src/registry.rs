//! Service registry
//!
//! An in-memory directory of running services, constructed once at startup and
//! handed to whoever needs it. A service name may be registered several times;
//! lookups return every registration.

use crate::config::RegistryConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// One running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: String,
    pub address: String,
    /// Distinguishes implementations of the same service
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl fmt::Display for ServiceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<ServiceNode>,
}

#[derive(Debug, Default)]
pub struct Registry {
    services: Mutex<HashMap<String, Vec<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the statically configured services.
    pub fn from_config(config: &RegistryConfig) -> Self {
        let registry = Self::new();
        for service in &config.services {
            registry.add(service.clone());
        }
        registry
    }

    pub fn add(&self, service: Service) {
        tracing::debug!(service = %service.name, nodes = service.nodes.len(), "service registered");
        self.services
            .lock()
            .entry(service.name.clone())
            .or_default()
            .push(service);
    }

    /// Every registration of `name`, in registration order.
    pub fn get_service(&self, name: &str) -> Vec<Service> {
        self.services.lock().get(name).cloned().unwrap_or_default()
    }

    /// All nodes of all registrations of `name`.
    pub fn nodes(&self, name: &str) -> Vec<ServiceNode> {
        self.get_service(name)
            .into_iter()
            .flat_map(|s| s.nodes)
            .collect()
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
