//! Driver registry: workload type name → driver factory.

use crate::driver::docker::{DockerConfig, DockerDriver};
use crate::driver::{DriverRole, WorkloadDriver};
use crate::error::{HaulError, HaulResult};
use crate::rpc::messages::WorkloadDescriptor;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Builds a driver for one workload on one side of the migration
pub type DriverFactory =
    Arc<dyn Fn(&WorkloadDescriptor, DriverRole) -> HaulResult<Arc<dyn WorkloadDriver>> + Send + Sync>;

/// Known workload driver types
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the drivers shipped in this crate
    pub fn with_builtin(docker: DockerConfig) -> Self {
        let mut registry = Self::new();
        registry.register("docker", move |descriptor, role| {
            let driver = DockerDriver::new(&descriptor.id, role, docker.clone())?;
            Ok(Arc::new(driver) as Arc<dyn WorkloadDriver>)
        });
        registry
    }

    /// Add or replace a driver type
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&WorkloadDescriptor, DriverRole) -> HaulResult<Arc<dyn WorkloadDriver>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the driver registered for `descriptor.kind`
    pub fn create(
        &self,
        descriptor: &WorkloadDescriptor,
        role: DriverRole,
    ) -> HaulResult<Arc<dyn WorkloadDriver>> {
        let factory = self.factories.get(&descriptor.kind).ok_or_else(|| {
            let known: Vec<&str> = self.kinds().collect();
            HaulError::config(format!(
                "no driver registered for workload type '{}' (known: {})",
                descriptor.kind,
                known.join(", ")
            ))
        })?;
        info!(workload = %descriptor, role = %role, "Creating workload driver");
        factory(descriptor, role)
    }
}
