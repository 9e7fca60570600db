//! Node identity and the capability set shared by every node kind.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flow_core::component::ComponentError;
use flow_core::health::Health;
use flow_syntax::{Block, EvalError, Scope, Value};
use tokio_util::sync::CancellationToken;

use super::node_component::ComponentNode;
use super::node_config::{ArgumentNode, ExportNode};
use super::node_custom::CustomComponentNode;
use super::node_import::ImportNode;
use crate::import_source::SourceError;

/// Dotted, ordered path identifying one node within a controller scope.
///
/// For a labeled block the label is the final segment, so `counter "c"`
/// becomes `counter.c` and `import.file "mods"` becomes `import.file.mods`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId {
    segments: Vec<String>,
    joined: String,
}

impl ComponentId {
    /// Identity of the node a block materializes into.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        let mut segments = block.name.clone();
        if let Some(label) = &block.label {
            segments.push(label.clone());
        }
        Self::from_segments(segments)
    }

    /// Build an id from raw path segments.
    #[must_use]
    pub fn from_segments(segments: Vec<String>) -> Self {
        let joined = segments.join(".");
        Self { segments, joined }
    }

    /// Path segments, label included.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The dotted string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.joined
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.joined)
    }
}

/// Join a controller id and a node id into a globally unique id.
#[must_use]
pub fn global_id(controller_id: &str, node_id: &str) -> String {
    if controller_id.is_empty() {
        node_id.to_string()
    } else {
        format!("{controller_id}/{node_id}")
    }
}

/// Notifies the controller that a node needs its dependents re-evaluated.
pub(crate) type NotifySink = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives `(export name, value)` pairs from export nodes.
pub(crate) type ExportSink = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Errors surfaced by node evaluation and run.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A reference in the block body could not be resolved.
    #[error("component evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    /// The managed component rejected its arguments or failed.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// An import source failed to apply its arguments.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A module template could not be resolved.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// A module body failed to parse or load.
    #[error("module load failed: {0}")]
    ModuleLoad(String),

    /// A required module argument has no value.
    #[error("missing required argument `{0}`")]
    MissingArgument(String),

    /// An `export` block has no `value` attribute.
    #[error("export `{0}` has no value attribute")]
    MissingExportValue(String),

    /// Run was invoked before a successful evaluation.
    #[error("component has not been evaluated")]
    Unevaluated,
}

/// Module template resolution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    /// The consumer requested a declare the provider does not publish.
    #[error("module `{module}` not found in import `{import}`")]
    NotFound {
        /// The requested declare path.
        module: String,
        /// Label of the import node consulted.
        import: String,
    },

    /// The providing import node no longer exists.
    #[error("import providing `{0}` is no longer available")]
    Gone(String),
}

/// The two healths every node tracks, combined on read.
#[derive(Debug)]
pub(crate) struct NodeHealth {
    inner: Mutex<HealthPair>,
}

#[derive(Debug, Clone)]
struct HealthPair {
    eval: Health,
    run: Health,
}

impl NodeHealth {
    pub(crate) fn new() -> Self {
        let initial = Health::unknown("component created");
        Self {
            inner: Mutex::new(HealthPair { eval: initial.clone(), run: initial }),
        }
    }

    pub(crate) fn set_eval(&self, health: Health) {
        self.inner.lock().unwrap().eval = health;
    }

    pub(crate) fn set_run(&self, health: Health) {
        self.inner.lock().unwrap().run = health;
    }

    /// Least healthy of run, eval, and an optional component-reported
    /// health.
    pub(crate) fn current(&self, component: Option<Health>) -> Health {
        let pair = self.inner.lock().unwrap().clone();
        match component {
            Some(extra) => Health::least_healthy([&pair.run, &pair.eval, &extra]),
            None => Health::least_healthy([&pair.run, &pair.eval]),
        }
    }

    /// Record an evaluation outcome the way every node reports it.
    pub(crate) fn record_eval<E: std::fmt::Display>(&self, result: &Result<(), E>) {
        match result {
            Ok(()) => self.set_eval(Health::healthy("component evaluated")),
            Err(err) => {
                self.set_eval(Health::unhealthy(format!(
                    "component evaluation failed: {err}"
                )));
            }
        }
    }
}

/// One controller-owned node.
///
/// The controller manipulates every variant through this capability set
/// only; nodes never hold owning references to each other.
#[derive(Clone)]
pub(crate) enum Node {
    Component(Arc<ComponentNode>),
    Custom(Arc<CustomComponentNode>),
    Import(Arc<ImportNode>),
    Argument(Arc<ArgumentNode>),
    Export(Arc<ExportNode>),
}

impl Node {
    pub(crate) fn id(&self) -> &ComponentId {
        match self {
            Self::Component(n) => n.id(),
            Self::Custom(n) => n.id(),
            Self::Import(n) => n.id(),
            Self::Argument(n) => n.id(),
            Self::Export(n) => n.id(),
        }
    }

    /// Kind discriminant used by the loader's diff to decide re-use.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Component(_) => "component",
            Self::Custom(_) => "custom",
            Self::Import(_) => "import",
            Self::Argument(_) => "argument",
            Self::Export(_) => "export",
        }
    }

    /// Stash a new block ahead of re-evaluation.
    pub(crate) async fn set_block(&self, block: Block) {
        match self {
            Self::Component(n) => n.set_block(block).await,
            Self::Custom(n) => n.set_block(block).await,
            Self::Import(n) => n.set_block(block),
            Self::Argument(n) => n.set_block(block),
            Self::Export(n) => n.set_block(block),
        }
    }

    /// Evaluate the node against a scope, recording evaluation health.
    pub(crate) async fn evaluate(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        match self {
            Self::Component(n) => n.evaluate(scope).await,
            Self::Custom(n) => n.evaluate(scope).await,
            Self::Import(n) => n.evaluate(scope),
            Self::Argument(n) => n.evaluate(scope),
            Self::Export(n) => n.evaluate(scope),
        }
    }

    /// The value dependents see for this node, if it exports anything.
    pub(crate) fn exports_for_scope(&self) -> Option<Value> {
        match self {
            Self::Component(n) => Some(n.exports()),
            Self::Custom(n) => Some(n.exports()),
            // Import nodes publish declares, not exports.
            Self::Import(_) | Self::Export(_) => None,
            Self::Argument(n) => Some(n.exports()),
        }
    }

    /// Whether the node owns a long-running task.
    pub(crate) fn is_runnable(&self) -> bool {
        matches!(self, Self::Component(_) | Self::Custom(_) | Self::Import(_))
    }

    /// Run the node until cancellation. Only meaningful for runnable nodes.
    pub(crate) async fn run(&self, ctx: CancellationToken) -> Result<(), NodeError> {
        match self {
            Self::Component(n) => n.run(ctx).await,
            Self::Custom(n) => n.run(ctx).await,
            Self::Import(n) => n.run(ctx).await,
            Self::Argument(_) | Self::Export(_) => Ok(()),
        }
    }

    /// Current health, combining run, eval, and component-reported healths.
    pub(crate) fn health(&self) -> Health {
        match self {
            Self::Component(n) => n.current_health(),
            Self::Custom(n) => n.current_health(),
            Self::Import(n) => n.current_health(),
            Self::Argument(n) => n.current_health(),
            Self::Export(n) => n.current_health(),
        }
    }

    /// Timestamp of the node's last successful update, if tracked.
    pub(crate) fn last_updated(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Component(n) => n.last_updated(),
            Self::Import(n) => n.last_updated(),
            _ => None,
        }
    }

    /// Release per-node resources after the node's task has joined.
    pub(crate) async fn on_removed(&self) {
        match self {
            Self::Component(n) => n.on_removed().await,
            Self::Custom(n) => n.on_removed().await,
            Self::Import(_) | Self::Argument(_) | Self::Export(_) => {}
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id().as_str())
            .field("kind", &self.kind())
            .finish()
    }
}
