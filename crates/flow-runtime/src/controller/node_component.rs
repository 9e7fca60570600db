//! The node wrapping one user component instance.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use flow_core::component::{BuildFn, Component, Options};
use flow_core::health::Health;
use flow_core::registry::Unregisterer;
use flow_syntax::{eval_body, Block, Scope, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::node::{global_id, ComponentId, NodeError, NodeHealth};
use super::NodeGlobals;

/// Wraps one user component: evaluates its arguments, runs its lifecycle,
/// and propagates export changes to the controller.
pub(crate) struct ComponentNode {
    id: ComponentId,
    global_id: String,
    component_name: String,
    build: BuildFn,
    globals: NodeGlobals,
    span: tracing::Span,

    // Exclusive across evaluation; also guards the managed instance.
    state: tokio::sync::Mutex<ComponentState>,

    // Read often by dependents building scopes, written rarely.
    exports: RwLock<Value>,

    health: NodeHealth,
}

struct ComponentState {
    block: Block,
    component: Option<Arc<dyn Component>>,
    args: Value,
    registerer: Option<Unregisterer>,
    last_updated: Option<DateTime<Utc>>,
}

impl ComponentNode {
    /// Create a node for a block. The component itself is not built until
    /// the first evaluation.
    pub(crate) fn new(block: Block, build: BuildFn, globals: NodeGlobals) -> Arc<Self> {
        let id = ComponentId::from_block(&block);
        let global_id = global_id(&globals.controller_id, id.as_str());
        let component_name = block.full_name();
        let span = tracing::info_span!("component", id = %global_id);
        Arc::new(Self {
            id,
            global_id,
            component_name,
            build,
            globals,
            span,
            state: tokio::sync::Mutex::new(ComponentState {
                block,
                component: None,
                args: Value::Null,
                registerer: None,
                last_updated: None,
            }),
            exports: RwLock::new(Value::Null),
            health: NodeHealth::new(),
        })
    }

    pub(crate) fn id(&self) -> &ComponentId {
        &self.id
    }

    /// The dotted block name, e.g. `prometheus.relabel`.
    pub(crate) fn component_name(&self) -> &str {
        &self.component_name
    }

    pub(crate) async fn set_block(&self, block: Block) {
        self.state.lock().await.block = block;
    }

    /// Re-bind arguments from the block body against `scope`, building the
    /// component on the first call and updating it afterwards.
    ///
    /// Unchanged arguments are a no-op so export-change fan-out does not
    /// re-apply identical configs.
    pub(crate) async fn evaluate(self: &Arc<Self>, scope: &Scope<'_>) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope).await;
        self.health.record_eval(&result);
        result
    }

    async fn evaluate_inner(self: &Arc<Self>, scope: &Scope<'_>) -> Result<(), NodeError> {
        let mut state = self.state.lock().await;
        let args = eval_body(&state.block.body, scope)?;

        if let Some(component) = state.component.clone() {
            if args == state.args {
                return Ok(());
            }
            component.update(args.clone())?;
        } else {
            let registerer = Unregisterer::wrap(self.globals.registry.clone());
            let options = self.build_options(registerer.clone());
            let component = (self.build)(options, args.clone())?;
            state.component = Some(component);
            state.registerer = Some(registerer);
        }

        state.args = args;
        state.last_updated = Some(Utc::now());
        Ok(())
    }

    fn build_options(self: &Arc<Self>, registerer: Unregisterer) -> Options {
        let weak = Arc::downgrade(self);
        let on_state_change: flow_core::component::OnStateChange =
            Arc::new(move |exports| {
                if let Some(node) = weak.upgrade() {
                    node.set_exports(exports);
                }
            });
        Options {
            id: self.global_id.clone(),
            span: self.span.clone(),
            registerer,
            data_path: self.globals.data_path.join(&self.global_id),
            on_state_change,
            get_service_data: self.globals.get_service_data.clone(),
        }
    }

    /// Store new exports and notify the controller when they changed.
    ///
    /// Writes are monotonic: a reader observing exports `E` never later
    /// observes a value older than `E`.
    fn set_exports(&self, exports: Value) {
        {
            let mut current = self.exports.write().unwrap();
            if *current == exports {
                return;
            }
            *current = exports;
        }
        (self.globals.on_node_update)(self.id.as_str());
    }

    pub(crate) fn exports(&self) -> Value {
        self.exports.read().unwrap().clone()
    }

    pub(crate) async fn arguments(&self) -> Value {
        self.state.lock().await.args.clone()
    }

    pub(crate) async fn debug_info(&self) -> Option<Value> {
        let component = self.state.lock().await.component.clone()?;
        component.debug_info()
    }

    /// Run the managed component until cancellation.
    ///
    /// Returns [`NodeError::Unevaluated`] if no evaluation has built the
    /// component yet.
    pub(crate) async fn run(&self, ctx: CancellationToken) -> Result<(), NodeError> {
        let component = self.state.lock().await.component.clone();
        let Some(component) = component else {
            return Err(NodeError::Unevaluated);
        };

        self.health.set_run(Health::healthy("started component"));
        info!(component = %self.global_id, "starting component");

        let result = component.run(ctx).await;
        match &result {
            Ok(()) => {
                info!(component = %self.global_id, "component exited");
                self.health.set_run(Health::exited("component shut down normally"));
            }
            Err(err) => {
                error!(component = %self.global_id, %err, "component exited with error");
                self.health.set_run(Health::exited(format!(
                    "component shut down with error: {err}"
                )));
            }
        }
        result.map_err(Into::into)
    }

    /// Health combining run, eval, and the component's own report.
    pub(crate) fn current_health(&self) -> Health {
        self.health.current(self.component_health())
    }

    fn component_health(&self) -> Option<Health> {
        // Peek without waiting: health reads must never block behind an
        // in-flight evaluation.
        let state = self.state.try_lock().ok()?;
        state.component.as_ref()?.current_health()
    }

    pub(crate) fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state
            .try_lock()
            .ok()
            .and_then(|state| state.last_updated)
    }

    /// Unregister every collector the component registered.
    pub(crate) async fn on_removed(&self) {
        let registerer = self.state.lock().await.registerer.clone();
        if let Some(registerer) = registerer {
            if let Err(err) = registerer.unregister_all() {
                error!(component = %self.global_id, %err, "failed to unregister collectors");
            }
        }
    }
}
