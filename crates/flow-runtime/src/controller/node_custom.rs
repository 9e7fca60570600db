//! The node materializing a component from a `declare` template.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock, Weak};

use flow_core::health::Health;
use flow_syntax::{eval_body, Block, Scope, Value};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::node::{global_id, ComponentId, ModuleError, NodeError, NodeHealth};
use super::node_import::ImportNode;
use super::NodeGlobals;
use crate::{Flow, Source};

/// Where a custom component's declare body comes from.
pub(crate) enum TemplateProvider {
    /// A declare published by an import node, addressed by its (possibly
    /// namespaced) name.
    Import {
        /// The providing import node. Weak: nodes never own each other.
        node: Weak<ImportNode>,
        /// Declare path inside the import, e.g. `inner.t`.
        path: String,
    },
    /// A `declare` block in the same source, captured verbatim.
    Local {
        /// The declare's body text.
        content: String,
    },
}

/// A component whose implementation is a module: its arguments feed the
/// module's `argument` nodes and the module's `export` values surface as
/// this node's exports under an `exports` object.
pub(crate) struct CustomComponentNode {
    id: ComponentId,
    global_id: String,
    globals: NodeGlobals,
    provider: Mutex<Option<TemplateProvider>>,
    state: tokio::sync::Mutex<CustomState>,
    exports: RwLock<Value>,
    health: NodeHealth,
}

struct CustomState {
    block: Block,
    content: String,
    args: Value,
    child: Option<Flow>,
}

impl CustomComponentNode {
    pub(crate) fn new(block: Block, globals: NodeGlobals) -> Arc<Self> {
        let id = ComponentId::from_block(&block);
        let global_id = global_id(&globals.controller_id, id.as_str());
        Arc::new(Self {
            id,
            global_id,
            globals,
            provider: Mutex::new(None),
            state: tokio::sync::Mutex::new(CustomState {
                block,
                content: String::new(),
                args: Value::Null,
                child: None,
            }),
            exports: RwLock::new(Value::Null),
            health: NodeHealth::new(),
        })
    }

    pub(crate) fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Re-wire the template provider; the loader does this on every apply
    /// so local declare edits and import replacements take effect.
    pub(crate) fn set_provider(&self, provider: TemplateProvider) {
        *self.provider.lock().unwrap() = Some(provider);
    }

    pub(crate) async fn set_block(&self, block: Block) {
        self.state.lock().await.block = block;
    }

    fn resolve_template(&self) -> Result<String, NodeError> {
        let provider = self.provider.lock().unwrap();
        match provider.as_ref() {
            None => Err(ModuleError::Gone(self.id.as_str().to_string()).into()),
            Some(TemplateProvider::Local { content }) => Ok(content.clone()),
            Some(TemplateProvider::Import { node, path }) => {
                let node = node
                    .upgrade()
                    .ok_or_else(|| ModuleError::Gone(self.id.as_str().to_string()))?;
                Ok(node.module_content(path)?)
            }
        }
    }

    /// Evaluate arguments and (re)load the module body into the child
    /// controller. Template changes reload the child with graph diffing,
    /// so components inside the module that survive the change keep
    /// running; pure argument changes skip the reload entirely.
    pub(crate) async fn evaluate(self: &Arc<Self>, scope: &Scope<'_>) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope).await;
        self.health.record_eval(&result);
        result
    }

    fn evaluate_inner<'a>(
        self: &'a Arc<Self>,
        scope: &'a Scope<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<(), NodeError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let args = eval_body(&state.block.body, scope)?;
            let content = self.resolve_template()?;
            let args_map = match &args {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };

            if state.child.is_none() || state.content != content {
                let source = Source::parse(&content)
                    .map_err(|err| NodeError::ModuleLoad(err.to_string()))?;
                let child = match &state.child {
                    Some(child) => child.clone(),
                    None => {
                        let child = self.new_child();
                        state.child = Some(child.clone());
                        child
                    }
                };
                let load: Pin<Box<dyn Future<Output = Result<(), crate::LoadError>> + Send + '_>> =
                    Box::pin(child.load_source(&source, Some(args_map)));
                load.await
                    .map_err(|err| NodeError::ModuleLoad(err.to_string()))?;
                state.content = content;
                state.args = args;
            } else if state.args != args {
                let child = state.child.clone().ok_or(NodeError::Unevaluated)?;
                child.update_module_args(args_map).await;
                state.args = args;
            }
            Ok(())
        })
    }

    fn new_child(self: &Arc<Self>) -> Flow {
        let weak = Arc::downgrade(self);
        let on_exports: Arc<dyn Fn(Value) + Send + Sync> = Arc::new(move |exports| {
            if let Some(node) = weak.upgrade() {
                node.set_exports(json!({ "exports": exports }));
            }
        });

        let mut globals = self.globals.clone();
        globals.controller_id = self.global_id.clone();
        Flow::new_module(globals, on_exports)
    }

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

    /// Run the module's controller until cancellation.
    pub(crate) async fn run(&self, ctx: CancellationToken) -> Result<(), NodeError> {
        let child = self.state.lock().await.child.clone();
        let Some(child) = child else {
            return Err(NodeError::Unevaluated);
        };

        self.health.set_run(Health::healthy("started component"));
        info!(component = %self.global_id, "starting module component");

        child.run(ctx).await;

        info!(component = %self.global_id, "module component exited");
        self.health.set_run(Health::exited("component shut down normally"));
        Ok(())
    }

    pub(crate) fn current_health(&self) -> Health {
        self.health.current(None)
    }

    /// Tear down the module's own components so their collectors leave the
    /// shared registry.
    pub(crate) fn on_removed<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let child = self.state.lock().await.child.take();
            if let Some(child) = child {
                let abort: Pin<Box<dyn Future<Output = ()> + Send>> =
                    Box::pin(async move { child.abort().await });
                abort.await;
            }
        })
    }
}

impl std::fmt::Debug for CustomComponentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomComponentNode")
            .field("id", &self.id.as_str())
            .finish_non_exhaustive()
    }
}
