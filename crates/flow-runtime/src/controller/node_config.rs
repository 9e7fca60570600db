//! Module configuration nodes: `argument` and `export` blocks.

use std::sync::{Arc, Mutex, RwLock};

use flow_core::health::Health;
use flow_syntax::{eval_body, Block, Scope, Value};
use serde_json::json;

use super::node::{ComponentId, ExportSink, NodeError, NodeHealth, NotifySink};

/// Materializes an `argument "name" { optional = ... }` block inside a
/// module. Exports `{ value }` so references like `argument.in.value`
/// resolve through the ordinary scope machinery.
pub(crate) struct ArgumentNode {
    id: ComponentId,
    label: String,
    state: Mutex<ArgumentState>,
    exports: RwLock<Value>,
    health: NodeHealth,
    sink: NotifySink,
}

struct ArgumentState {
    block: Block,
    // Value supplied by the module consumer, if any.
    value: Option<Value>,
    optional: bool,
    default: Option<Value>,
}

impl ArgumentNode {
    pub(crate) fn new(block: Block, sink: NotifySink) -> Arc<Self> {
        let id = ComponentId::from_block(&block);
        let label = block.label.clone().unwrap_or_default();
        Arc::new(Self {
            id,
            label,
            state: Mutex::new(ArgumentState {
                block,
                value: None,
                optional: false,
                default: None,
            }),
            exports: RwLock::new(Value::Null),
            health: NodeHealth::new(),
            sink,
        })
    }

    pub(crate) fn id(&self) -> &ComponentId {
        &self.id
    }

    /// The argument name as the module consumer supplies it.
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn set_block(&self, block: Block) {
        self.state.lock().unwrap().block = block;
    }

    /// Re-read `optional`/`default` from the block body and publish the
    /// effective value.
    pub(crate) fn evaluate(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope);
        self.health.record_eval(&result);
        result
    }

    fn evaluate_inner(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        let effective = {
            let mut state = self.state.lock().unwrap();
            let settings = eval_body(&state.block.body, scope)?;
            state.optional = settings
                .get("optional")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            state.default = settings.get("default").cloned();
            self.effective_value(&state)?
        };
        *self.exports.write().unwrap() = json!({ "value": effective });
        Ok(())
    }

    fn effective_value(&self, state: &ArgumentState) -> Result<Value, NodeError> {
        match state.value.clone().or_else(|| state.default.clone()) {
            Some(value) => Ok(value),
            None if state.optional => Ok(Value::Null),
            None => Err(NodeError::MissingArgument(self.label.clone())),
        }
    }

    /// Supply (or clear) the consumer's value; dependents re-evaluate when
    /// it changed.
    pub(crate) fn set_value(&self, value: Option<Value>) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.value == value {
                false
            } else {
                state.value = value;
                match self.effective_value(&state) {
                    Ok(effective) => {
                        *self.exports.write().unwrap() = json!({ "value": effective });
                        self.health.set_eval(Health::healthy("component evaluated"));
                    }
                    Err(err) => {
                        *self.exports.write().unwrap() = Value::Null;
                        self.health.set_eval(Health::unhealthy(format!(
                            "component evaluation failed: {err}"
                        )));
                    }
                }
                true
            }
        };
        if changed {
            (self.sink)(self.id.as_str());
        }
    }

    pub(crate) fn exports(&self) -> Value {
        self.exports.read().unwrap().clone()
    }

    pub(crate) fn current_health(&self) -> Health {
        self.health.current(None)
    }
}

/// Materializes an `export "name" { value = expr }` block inside a module.
/// Evaluating it publishes the value through the module's export sink.
pub(crate) struct ExportNode {
    id: ComponentId,
    label: String,
    block: Mutex<Block>,
    value: RwLock<Value>,
    sink: ExportSink,
    health: NodeHealth,
}

impl ExportNode {
    pub(crate) fn new(block: Block, sink: ExportSink) -> Arc<Self> {
        let id = ComponentId::from_block(&block);
        let label = block.label.clone().unwrap_or_default();
        Arc::new(Self {
            id,
            label,
            block: Mutex::new(block),
            value: RwLock::new(Value::Null),
            sink,
            health: NodeHealth::new(),
        })
    }

    pub(crate) fn id(&self) -> &ComponentId {
        &self.id
    }

    pub(crate) fn set_block(&self, block: Block) {
        *self.block.lock().unwrap() = block;
    }

    /// Evaluate the exported expression; publishes only on change so one
    /// evaluation pass produces at most one notification per export.
    pub(crate) fn evaluate(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope);
        self.health.record_eval(&result);
        result
    }

    fn evaluate_inner(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        let body = self.block.lock().unwrap().body.clone();
        let evaluated = eval_body(&body, scope)?;
        let Some(value) = evaluated.get("value").cloned() else {
            return Err(NodeError::MissingExportValue(self.label.clone()));
        };

        {
            let mut current = self.value.write().unwrap();
            if *current == value {
                return Ok(());
            }
            *current = value.clone();
        }
        (self.sink)(&self.label, value);
        Ok(())
    }

    pub(crate) fn current_health(&self) -> Health {
        self.health.current(None)
    }
}
