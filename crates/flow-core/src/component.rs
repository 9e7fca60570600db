//! The contract between the controller and component implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::health::Health;
use crate::registry::Unregisterer;

/// Errors surfaced by component construction, update, and run.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// Arguments failed to decode or validate.
    #[error(transparent)]
    Arguments(#[from] ArgumentsError),

    /// The component failed at runtime.
    #[error("{0}")]
    Runtime(String),
}

/// Errors produced while decoding a raw argument value into a typed struct.
#[derive(Debug, thiserror::Error)]
pub enum ArgumentsError {
    /// serde rejected the raw value.
    #[error("failed to decode arguments: {0}")]
    Decode(#[from] serde_json::Error),

    /// The decoded arguments failed the component's validation.
    #[error("invalid arguments: {0}")]
    Validation(String),
}

/// Typed argument structs implement this to opt into [`decode_arguments`].
///
/// Defaults come from `Default` (use `#[serde(default)]` so absent attributes
/// fall back to it) and `validate` runs after decoding.
pub trait ComponentArguments: DeserializeOwned + Default {
    /// Reject argument combinations serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ArgumentsError::Validation`] describing the rejected value.
    fn validate(&self) -> Result<(), ArgumentsError> {
        Ok(())
    }
}

/// Decode an evaluated argument object into a typed struct and validate it.
///
/// # Errors
///
/// Returns [`ArgumentsError::Decode`] if serde rejects the value and
/// [`ArgumentsError::Validation`] if the struct's own checks do.
pub fn decode_arguments<T: ComponentArguments>(value: Value) -> Result<T, ArgumentsError> {
    let args: T = serde_json::from_value(value)?;
    args.validate()?;
    Ok(args)
}

/// Closure a component calls to publish new exports.
pub type OnStateChange = Arc<dyn Fn(Value) + Send + Sync>;

/// Lookup for data shared by host services (clustering, label stores, ...).
pub type ServiceDataFn =
    Arc<dyn Fn(&str) -> Result<Value, ServiceDataError> + Send + Sync>;

/// Errors from [`ServiceDataFn`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceDataError {
    /// No service with that name is available to this controller.
    #[error("service `{0}` is not defined")]
    NotFound(String),
}

/// Everything a component receives from the controller at build time.
#[derive(Clone)]
pub struct Options {
    /// Globally unique component id (controller id + node id).
    pub id: String,

    /// Span the component should enter for its own log output.
    pub span: tracing::Span,

    /// Dedicated metrics registrar. Collectors registered here are
    /// unregistered as a set when the component is torn down.
    pub registerer: Unregisterer,

    /// Directory the component may persist opaque state under. The
    /// controller neither creates nor inspects it.
    pub data_path: PathBuf,

    /// Publishes new exports to the controller; dependents re-evaluate.
    pub on_state_change: OnStateChange,

    /// Access to host service data by service name.
    pub get_service_data: ServiceDataFn,
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("id", &self.id)
            .field("data_path", &self.data_path)
            .finish_non_exhaustive()
    }
}

/// A long-lived component instance managed by the controller.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Run until `ctx` is cancelled. Called exactly once, after the first
    /// successful evaluation.
    async fn run(&self, ctx: CancellationToken) -> Result<(), ComponentError>;

    /// Apply re-evaluated arguments. Called on every evaluation after the
    /// one that built the component.
    ///
    /// # Errors
    ///
    /// Returning an error leaves the component running with its previous
    /// arguments; the node's evaluation health turns unhealthy.
    fn update(&self, args: Value) -> Result<(), ComponentError>;

    /// Component-reported health, combined into the node's health. `None`
    /// means the component does not track its own health.
    fn current_health(&self) -> Option<Health> {
        None
    }

    /// Opaque debug payload surfaced through the controller's
    /// introspection API.
    fn debug_info(&self) -> Option<Value> {
        None
    }
}

/// Builder signature for a registered component kind.
pub type BuildFn = Arc<
    dyn Fn(Options, Value) -> Result<Arc<dyn Component>, ComponentError> + Send + Sync,
>;

/// One registered component kind.
#[derive(Clone)]
pub struct Registration {
    /// Dotted block name users write, e.g. `"prometheus.relabel"`.
    pub name: &'static str,
    /// Builds an instance from options and evaluated arguments.
    pub build: BuildFn,
}

impl Registration {
    /// Convenience constructor deriving the builder from a typed arguments
    /// struct and a build closure.
    pub fn new<T, F, C>(name: &'static str, build: F) -> Self
    where
        T: ComponentArguments,
        C: Component,
        F: Fn(Options, T) -> Result<C, ComponentError> + Send + Sync + 'static,
    {
        Self {
            name,
            build: Arc::new(move |opts, raw| {
                let args = decode_arguments::<T>(raw)?;
                Ok(Arc::new(build(opts, args)?) as Arc<dyn Component>)
            }),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("name", &self.name).finish()
    }
}

/// Errors from [`ComponentRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A component kind with that name is already registered.
    #[error("component `{0}` is already registered")]
    Duplicate(String),
}

/// Explicit name → builder map handed to each controller.
///
/// There is intentionally no process-global registry; every controller is
/// self-contained.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    builders: HashMap<String, BuildFn>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the name is taken.
    pub fn register(&mut self, registration: Registration) -> Result<(), RegistryError> {
        if self.builders.contains_key(registration.name) {
            return Err(RegistryError::Duplicate(registration.name.to_string()));
        }
        self.builders
            .insert(registration.name.to_string(), registration.build);
        Ok(())
    }

    /// Look up a builder by dotted block name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<BuildFn> {
        self.builders.get(name).cloned()
    }

    /// Whether a component kind with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.builders.len())
            .finish()
    }
}
