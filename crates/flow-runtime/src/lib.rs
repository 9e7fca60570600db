//! # flow-runtime
//!
//! The Flow component controller: the runtime that turns a parsed
//! configuration into a dependency DAG of long-lived component instances,
//! evaluates it topologically, reloads it on configuration changes with
//! minimum churn, and hot-reloads imported modules when their sources
//! change.
//!
//! ## Example
//!
//! ```rust,no_run
//! use flow_runtime::{Flow, Options, Source};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(components: flow_core::ComponentRegistry) {
//! let controller = Flow::new(Options {
//!     components,
//!     ..Options::default()
//! });
//!
//! let source = Source::parse("counter \"c\" { max = 10 }").unwrap();
//! controller.load_source(&source, None).await.unwrap();
//!
//! let ctx = CancellationToken::new();
//! controller.run(ctx).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod controller;
pub mod import_source;
mod source;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

pub use controller::{ComponentId, ComponentInfo, CycleError, LoadError, ModuleError, NodeError};
use controller::loader::Loader;
use controller::node::{ExportSink, NotifySink};
use controller::queue::Queue;
use controller::scheduler::Scheduler;
use controller::NodeGlobals;
use flow_core::component::{ComponentRegistry, ServiceDataError, ServiceDataFn};
use flow_syntax::Value;
pub use import_source::{SourceError, SourceKind};
use prometheus::{IntCounter, IntGauge, Registry};
use serde_json::Map;
pub use source::Source;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Options for a root controller.
pub struct Options {
    /// Controller id, prefixed onto every component's global id. Empty for
    /// a standalone root controller.
    pub controller_id: String,

    /// Root directory for per-component data directories.
    pub data_path: PathBuf,

    /// Metrics registry shared by every component in this controller tree.
    pub registry: Registry,

    /// The component kinds this controller can materialize.
    pub components: ComponentRegistry,

    /// Host service data, looked up by components via their options.
    pub services: HashMap<String, Value>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            controller_id: String::new(),
            data_path: std::env::temp_dir().join("flow"),
            registry: Registry::new(),
            components: ComponentRegistry::new(),
            services: HashMap::new(),
        }
    }
}

struct ControllerMetrics {
    components: IntGauge,
    evaluations: IntCounter,
}

impl ControllerMetrics {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let components = IntGauge::new(
            "flow_controller_managed_components",
            "Number of components managed by the controller",
        )?;
        registry.register(Box::new(components.clone()))?;
        let evaluations = IntCounter::new(
            "flow_controller_evaluation_passes_total",
            "Total re-evaluation passes performed by the controller",
        )?;
        registry.register(Box::new(evaluations.clone()))?;
        Ok(Self { components, evaluations })
    }
}

struct ControllerInner {
    controller_id: String,
    queue: Arc<Queue>,
    sched: Scheduler,
    loader: Loader,
    root_token: CancellationToken,
    module_exports: RwLock<Map<String, Value>>,
    on_exports_change: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    metrics: Option<ControllerMetrics>,
}

impl ControllerInner {
    fn publish_export(&self, name: &str, value: Value) {
        let snapshot = {
            let mut exports = self.module_exports.write().unwrap();
            if exports.get(name) == Some(&value) {
                return;
            }
            exports.insert(name.to_string(), value);
            Value::Object(exports.clone())
        };
        if let Some(on_change) = &self.on_exports_change {
            on_change(snapshot);
        }
    }
}

/// The controller facade.
///
/// `Flow` is cheap to clone; clones share one controller. Load a source
/// with [`Flow::load_source`], then drive it with [`Flow::run`], which
/// blocks until the given token is cancelled and every node task has
/// joined.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<ControllerInner>,
}

impl Flow {
    /// Create a root controller.
    #[must_use]
    pub fn new(options: Options) -> Self {
        let services = options.services;
        let get_service_data: ServiceDataFn = Arc::new(move |name: &str| {
            services
                .get(name)
                .cloned()
                .ok_or_else(|| ServiceDataError::NotFound(name.to_string()))
        });
        Self::build(
            options.controller_id,
            options.data_path,
            options.registry,
            Arc::new(options.components),
            get_service_data,
            None,
        )
    }

    /// Create a module controller nested under a custom component.
    pub(crate) fn new_module(
        globals: NodeGlobals,
        on_exports: Arc<dyn Fn(Value) + Send + Sync>,
    ) -> Self {
        Self::build(
            globals.controller_id,
            globals.data_path,
            globals.registry,
            globals.components,
            globals.get_service_data,
            Some(on_exports),
        )
    }

    fn build(
        controller_id: String,
        data_path: PathBuf,
        registry: Registry,
        components: Arc<ComponentRegistry>,
        get_service_data: ServiceDataFn,
        on_exports_change: Option<Arc<dyn Fn(Value) + Send + Sync>>,
    ) -> Self {
        let queue = Arc::new(Queue::new());
        let notify: NotifySink = {
            let queue = queue.clone();
            Arc::new(move |id: &str| queue.enqueue(id))
        };
        let is_module = on_exports_change.is_some();

        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let export_sink: Option<ExportSink> = is_module.then(|| {
                let weak = weak.clone();
                let sink: ExportSink = Arc::new(move |name: &str, value: Value| {
                    if let Some(inner) = weak.upgrade() {
                        inner.publish_export(name, value);
                    }
                });
                sink
            });

            // Controller metrics live on the shared registry; only the root
            // registers them, module controllers would collide.
            let metrics = if controller_id.is_empty() {
                ControllerMetrics::register(&registry).ok()
            } else {
                None
            };

            let globals = NodeGlobals {
                controller_id: controller_id.clone(),
                data_path,
                registry,
                components,
                get_service_data,
                on_node_update: notify,
            };

            ControllerInner {
                controller_id,
                queue,
                sched: Scheduler::new(),
                loader: Loader::new(globals, is_module, export_sink),
                root_token: CancellationToken::new(),
                module_exports: RwLock::new(Map::new()),
                on_exports_change,
                metrics,
            }
        });
        Self { inner }
    }

    /// Load (or reload) a configuration source.
    ///
    /// Nodes whose `(name, label)` survives keep their instance and task;
    /// removed nodes are cancelled, joined, and have their collectors
    /// unregistered; added nodes start after a successful evaluation.
    ///
    /// `args` supplies module argument values and is only meaningful for
    /// module controllers.
    ///
    /// # Errors
    ///
    /// Structural errors (top-level shape, unknown component names, graph
    /// cycles) abort the load and leave the previous graph running.
    pub async fn load_source(
        &self,
        source: &Source,
        args: Option<Map<String, Value>>,
    ) -> Result<(), LoadError> {
        let started = self
            .inner
            .loader
            .apply(&self.inner.sched, source, args)
            .await?;

        if let Some(metrics) = &self.inner.metrics {
            let count = self.inner.loader.node_count().await;
            metrics
                .components
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }

        for node in started {
            let token = self.inner.root_token.child_token();
            let id = node.id().as_str().to_string();
            self.inner.sched.spawn(id, token.clone(), async move {
                let _ = node.run(token).await;
            });
        }
        Ok(())
    }

    /// Drive the controller until `ctx` is cancelled.
    ///
    /// Processes export-change and import-update notifications, re-evaluating
    /// dependents in topological order. On cancellation every node is shut
    /// down concurrently; returns once all node tasks have joined.
    pub async fn run(&self, ctx: CancellationToken) {
        debug!(controller = %self.display_id(), "controller running");
        loop {
            while !self.inner.queue.is_empty() {
                let batch = self.inner.queue.drain();
                for id in batch {
                    self.inner.loader.evaluate_dependents(&id).await;
                }
                if let Some(metrics) = &self.inner.metrics {
                    metrics.evaluations.inc();
                }
            }
            tokio::select! {
                () = ctx.cancelled() => break,
                () = self.inner.queue.wait() => {}
            }
        }

        self.inner.root_token.cancel();
        self.inner.sched.shutdown().await;
        debug!(controller = %self.display_id(), "controller stopped");
    }

    /// Current exports of the node with the given id, if any.
    pub async fn get_export(&self, id: &str) -> Option<Value> {
        self.inner.loader.get_export(id).await
    }

    /// Snapshot of every managed node's id, health, and exports.
    pub async fn list_components(&self) -> Vec<ComponentInfo> {
        self.inner.loader.component_infos().await
    }

    /// Re-bind module argument values; dependents of changed arguments
    /// re-evaluate through the normal scheduler path.
    pub(crate) async fn update_module_args(&self, args: Map<String, Value>) {
        self.inner.loader.update_module_args(args).await;
    }

    /// Tear the controller down outside of `run`: cancel every node task,
    /// join them, and release per-node resources.
    pub(crate) async fn abort(&self) {
        self.inner.root_token.cancel();
        self.inner.sched.shutdown().await;
        self.inner.loader.remove_all().await;
    }

    fn display_id(&self) -> &str {
        if self.inner.controller_id.is_empty() {
            "<root>"
        } else {
            &self.inner.controller_id
        }
    }
}
