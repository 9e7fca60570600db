//! The component controller: nodes, dependency graph, and scheduling.

pub(crate) mod dag;
pub(crate) mod loader;
pub(crate) mod node;
pub(crate) mod node_component;
pub(crate) mod node_config;
pub(crate) mod node_custom;
pub(crate) mod node_import;
pub(crate) mod queue;
pub(crate) mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;

pub use dag::CycleError;
use flow_core::component::{ComponentRegistry, ServiceDataFn};
pub use loader::{ComponentInfo, LoadError};
pub use node::{ComponentId, ModuleError, NodeError};
use node::NotifySink;

/// Everything nodes need from their owning controller.
#[derive(Clone)]
pub(crate) struct NodeGlobals {
    /// Id of the owning controller; empty for the root.
    pub controller_id: String,
    /// Root under which per-component data directories live.
    pub data_path: PathBuf,
    /// The shared metrics registry components register into (each behind
    /// its own unregisterer).
    pub registry: prometheus::Registry,
    /// Known component kinds.
    pub components: Arc<ComponentRegistry>,
    /// Host service data lookup.
    pub get_service_data: ServiceDataFn,
    /// Marks a node dirty with the controller's queue.
    pub on_node_update: NotifySink,
}

#[cfg(test)]
pub(crate) fn test_globals() -> NodeGlobals {
    use flow_core::component::ServiceDataError;

    NodeGlobals {
        controller_id: String::new(),
        data_path: std::env::temp_dir(),
        registry: prometheus::Registry::new(),
        components: Arc::new(ComponentRegistry::new()),
        get_service_data: Arc::new(|name: &str| {
            Err(ServiceDataError::NotFound(name.to_string()))
        }),
        on_node_update: Arc::new(|_: &str| {}),
    }
}
