//! Dependency discovery
//!
//! Walks the requirement manifests of registered descriptors and records
//! them in a [`DependencyGraph`]. No service code runs here.

use crate::descriptor::{ServiceDescriptor, ServiceMap};
use crate::{DependencyGraph, Error, Result};
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

/// Populates a dependency graph from registered descriptors
pub struct DependencyResolver<'a> {
    services: &'a ServiceMap,
}

impl<'a> DependencyResolver<'a> {
    /// Resolver over the given registrations
    pub fn new(services: &'a IndexMap<String, Arc<ServiceDescriptor>>) -> Self {
        Self { services }
    }

    /// Add every registered service and its requirements to `graph`
    pub fn resolve(&self, graph: &mut DependencyGraph<Arc<ServiceDescriptor>>) -> Result<()> {
        for (id, descriptor) in self.services {
            if graph.add_vertex(id.clone(), descriptor.clone()) {
                self.walk(descriptor, graph)?;
            }
        }
        debug!(
            "Resolved {} services with {} dependency edges",
            graph.len(),
            graph.edge_count()
        );
        Ok(())
    }

    /// Build a fresh graph from the registrations
    pub fn build(&self) -> Result<DependencyGraph<Arc<ServiceDescriptor>>> {
        let mut graph = DependencyGraph::new();
        self.resolve(&mut graph)?;
        Ok(graph)
    }

    fn walk(
        &self,
        descriptor: &Arc<ServiceDescriptor>,
        graph: &mut DependencyGraph<Arc<ServiceDescriptor>>,
    ) -> Result<()> {
        for required in descriptor.requires() {
            let Some(dependency) = self.services.get(required) else {
                debug!(
                    "Service '{}' requires unregistered '{}', leaving it unresolved",
                    descriptor.id(),
                    required
                );
                continue;
            };

            let discovered = graph.add_vertex(required.clone(), dependency.clone());
            match graph.add_edge(descriptor.id(), required) {
                Ok(()) | Err(Error::EdgeAlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
            if discovered {
                self.walk(dependency, graph)?;
            }
        }
        Ok(())
    }
}
