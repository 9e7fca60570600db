//! The node owning one import source and the declares it publishes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use flow_core::health::Health;
use flow_syntax::{eval_body, parse_file, Block, Scope, Stmt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::node::{global_id, ComponentId, ModuleError, NodeError, NodeHealth};
use super::NodeGlobals;
use crate::import_source::{
    new_import_source, ContentSink, ImportSource, SourceKind,
};

/// Fired when the node has ingested a new content revision.
pub(crate) type ImportSink = Arc<dyn Fn(&Arc<ImportNode>) + Send + Sync>;

/// Owns an [`ImportSource`], the map of declares parsed from its content,
/// and any nested child import nodes.
pub(crate) struct ImportNode {
    id: ComponentId,
    label: String,
    global_id: String,
    globals: NodeGlobals,
    source: Box<dyn ImportSource>,
    sink: ImportSink,
    block: Mutex<Block>,
    state: Mutex<ImportState>,
    health: NodeHealth,
}

struct ImportState {
    // Declare label -> verbatim body text. Replaced wholesale on every
    // content revision; child declares land under `child-label.name`.
    declares: HashMap<String, String>,
    children: BTreeMap<String, ChildImport>,
    // Suppresses child notifications while this node's own revision is
    // being ingested, so the controller sees one coalesced event.
    in_update: bool,
    last_update: Option<DateTime<Utc>>,
    run: Option<RunContext>,
}

struct ChildImport {
    node: Arc<ImportNode>,
    token: Option<CancellationToken>,
}

#[derive(Clone)]
struct RunContext {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ImportNode {
    /// Create an import node for a block; the source's arguments are not
    /// applied until the first evaluation.
    pub(crate) fn new(
        block: Block,
        kind: SourceKind,
        globals: NodeGlobals,
        sink: ImportSink,
    ) -> Arc<Self> {
        let id = ComponentId::from_block(&block);
        let label = block.label.clone().unwrap_or_default();
        let global_id = global_id(&globals.controller_id, id.as_str());
        let checkout_dir = globals.data_path.join(&global_id);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let content_sink: ContentSink = {
                let weak = weak.clone();
                Arc::new(move |content: String| {
                    if let Some(node) = weak.upgrade() {
                        node.on_content_update(content);
                    }
                })
            };
            Self {
                id,
                label,
                global_id,
                globals,
                source: new_import_source(kind, checkout_dir, content_sink),
                sink,
                block: Mutex::new(block),
                state: Mutex::new(ImportState {
                    declares: HashMap::new(),
                    children: BTreeMap::new(),
                    in_update: false,
                    last_update: None,
                    run: None,
                }),
                health: NodeHealth::new(),
            }
        })
    }

    pub(crate) fn id(&self) -> &ComponentId {
        &self.id
    }

    /// The import's label, which namespaces its declares for consumers.
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn set_block(&self, block: Block) {
        *self.block.lock().unwrap() = block;
    }

    /// Bind the source's arguments from the block body. Sources that can
    /// resolve content without waiting (inline, file) deliver it
    /// synchronously from here.
    pub(crate) fn evaluate(self: &Arc<Self>, scope: &Scope<'_>) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope);
        self.health.record_eval(&result);
        result
    }

    fn evaluate_inner(&self, scope: &Scope<'_>) -> Result<(), NodeError> {
        let body = self.block.lock().unwrap().body.clone();
        let args = eval_body(&body, scope)?;
        self.source.update(args)?;
        Ok(())
    }

    /// Look up a published declare body by its (possibly namespaced) name.
    pub(crate) fn module_content(&self, name: &str) -> Result<String, ModuleError> {
        self.state
            .lock()
            .unwrap()
            .declares
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound {
                module: name.to_string(),
                import: self.label.clone(),
            })
    }

    fn declares_snapshot(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .declares
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Ingest one new revision of the source's content.
    ///
    /// The declare map is replaced before the parse attempt, so a revision
    /// that fails to parse drops the previously good declares.
    fn on_content_update(self: &Arc<Self>, content: String) {
        let new_children: Vec<Arc<ImportNode>> = {
            let mut state = self.state.lock().unwrap();
            state.in_update = true;
            state.declares = HashMap::new();
            for child in state.children.values() {
                if let Some(token) = &child.token {
                    token.cancel();
                }
            }
            state.children = BTreeMap::new();

            let parsed = match parse_file(&content) {
                Ok(file) => file,
                Err(err) => {
                    error!(
                        component = %self.global_id,
                        %err,
                        "failed to parse imported content"
                    );
                    state.in_update = false;
                    return;
                }
            };

            for stmt in &parsed.body {
                match stmt {
                    Stmt::Block(block) => self.process_block(&mut state, block, &content),
                    Stmt::Attribute(_) => {
                        error!(
                            component = %self.global_id,
                            "only declare and import blocks are allowed in a module"
                        );
                    }
                }
            }
            state.children.values().map(|c| c.node.clone()).collect()
        };

        // Children are evaluated with the lock released: their sources may
        // resolve synchronously and call straight back into this node.
        for child in &new_children {
            if let Err(err) = child.evaluate(&Scope::root()) {
                error!(
                    component = %self.global_id,
                    child = %child.label,
                    %err,
                    "failed to evaluate nested import"
                );
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            self.start_pending_children(&mut state);
            state.last_update = Some(Utc::now());
            state.in_update = false;
        }

        (self.sink)(self);
    }

    fn process_block(self: &Arc<Self>, state: &mut ImportState, block: &Block, content: &str) {
        let name = block.full_name();
        if name == "declare" {
            let Some(label) = block.label.clone() else {
                error!(component = %self.global_id, "declare block requires a label");
                return;
            };
            if state.declares.contains_key(&label) {
                error!(component = %self.global_id, declare = %label, "declare block redefined");
                return;
            }
            state
                .declares
                .insert(label, block.body_text(content).to_string());
        } else if let Some(kind) = SourceKind::from_block_name(&name) {
            let Some(label) = block.label.clone() else {
                error!(component = %self.global_id, "import block requires a label");
                return;
            };
            if state.children.contains_key(&label) {
                error!(component = %self.global_id, import = %label, "import block redefined");
                return;
            }

            let mut child_globals = self.globals.clone();
            child_globals.controller_id = self.global_id.clone();
            let parent = Arc::downgrade(self);
            let child_sink: ImportSink = Arc::new(move |child: &Arc<ImportNode>| {
                if let Some(parent) = parent.upgrade() {
                    parent.ingest_child(child);
                }
            });
            let node = ImportNode::new(block.clone(), kind, child_globals, child_sink);
            state
                .children
                .insert(label, ChildImport { node, token: None });
        } else {
            error!(
                component = %self.global_id,
                forbidden = %name,
                "only declare and import blocks are allowed in a module"
            );
        }
    }

    /// Absorb a child's declares under `child-label.` namespacing.
    ///
    /// Notification is suppressed while this node's own content update is
    /// in flight; the update emits one coalesced event itself.
    fn ingest_child(self: &Arc<Self>, child: &Arc<ImportNode>) {
        let suppress = {
            let mut state = self.state.lock().unwrap();
            for (name, text) in child.declares_snapshot() {
                state
                    .declares
                    .insert(format!("{}.{}", child.label, name), text);
            }
            state.in_update
        };
        if !suppress {
            (self.sink)(self);
        }
    }

    fn start_pending_children(&self, state: &mut ImportState) {
        let Some(run) = state.run.clone() else {
            return;
        };
        for child in state.children.values_mut() {
            if child.token.is_some() {
                continue;
            }
            let token = run.token.child_token();
            child.token = Some(token.clone());
            let node = child.node.clone();
            let _ = run.tracker.spawn(async move {
                let _ = node.run(token).await;
            });
        }
    }

    /// Run the source and any nested imports until cancellation.
    pub(crate) async fn run(self: &Arc<Self>, ctx: CancellationToken) -> Result<(), NodeError> {
        let tracker = TaskTracker::new();
        {
            let mut state = self.state.lock().unwrap();
            state.run = Some(RunContext { token: ctx.clone(), tracker: tracker.clone() });
            self.start_pending_children(&mut state);
        }

        self.health.set_run(Health::healthy("started component"));
        info!(component = %self.global_id, "starting import node");

        let result = self.source.run(ctx).await;

        {
            let mut state = self.state.lock().unwrap();
            for child in state.children.values() {
                if let Some(token) = &child.token {
                    token.cancel();
                }
            }
            state.run = None;
        }
        tracker.close();
        tracker.wait().await;

        match &result {
            Ok(()) => {
                info!(component = %self.global_id, "import node exited");
                self.health.set_run(Health::exited("component shut down normally"));
            }
            Err(err) => {
                error!(component = %self.global_id, %err, "import node exited with error");
                self.health.set_run(Health::exited(format!(
                    "component shut down with error: {err}"
                )));
            }
        }
        result.map_err(Into::into)
    }

    /// Least healthy of run, eval, and the source's own health.
    pub(crate) fn current_health(&self) -> Health {
        self.health.current(Some(self.source.current_health()))
    }

    pub(crate) fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_update
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::controller::test_globals;

    fn import_block(src: &str) -> Block {
        parse_file(src).unwrap().body[0].as_block().unwrap().clone()
    }

    fn counting_sink() -> (ImportSink, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink: ImportSink = {
            let count = count.clone();
            Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (sink, count)
    }

    fn inline_node(content: &str, sink: ImportSink) -> Arc<ImportNode> {
        let src = format!("import.string \"m\" {{ content = {content:?} }}");
        let node = ImportNode::new(
            import_block(&src),
            SourceKind::Inline,
            test_globals(),
            sink,
        );
        node.evaluate(&Scope::root()).unwrap();
        node
    }

    #[test]
    fn test_declares_published_from_content() {
        let (sink, notified) = counting_sink();
        let node = inline_node("declare \"a\" { x = 1 }\ndeclare \"b\" { }", sink);

        assert_eq!(node.module_content("a").unwrap(), " x = 1 ");
        assert!(node.module_content("b").is_ok());
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let err = node.module_content("c").unwrap_err();
        assert!(matches!(err, ModuleError::NotFound { module, .. } if module == "c"));
    }

    #[test]
    fn test_parse_error_drops_previous_declares() {
        let (sink, notified) = counting_sink();
        let node = inline_node("declare \"a\" {}", sink);
        assert!(node.module_content("a").is_ok());
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // A malformed revision loses the old declares and emits nothing.
        node.on_content_update("declare \"a\" {".to_string());
        assert!(node.module_content("a").is_err());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forbidden_blocks_are_skipped_not_fatal() {
        let (sink, _) = counting_sink();
        let node = inline_node(
            "counter \"c\" { max = 1 }\ndeclare \"keep\" {}",
            sink,
        );
        assert!(node.module_content("keep").is_ok());
        assert!(node.module_content("counter").is_err());
    }

    #[test]
    fn test_nested_import_coalesces_to_one_notification() {
        let (sink, notified) = counting_sink();

        // The nested import resolves synchronously, so the parent must
        // still emit exactly one event for the whole revision.
        let inner = "declare \"t\" { y = 2 }";
        let content = format!(
            "declare \"top\" {{}}\nimport.string \"inner\" {{ content = {inner:?} }}"
        );
        let node = inline_node(&content, sink);

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(node.module_content("top").is_ok());
        assert_eq!(node.module_content("inner.t").unwrap(), " y = 2 ");
    }

    #[test]
    fn test_child_update_after_revision_notifies_parent() {
        let (sink, notified) = counting_sink();
        let content = "import.string \"inner\" { content = \"declare \\\"t\\\" {}\" }";
        let node = inline_node(content, sink);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Re-evaluating the child with new content outside a parent update
        // propagates one more notification.
        let child = node.state.lock().unwrap().children["inner"].node.clone();
        child.source
            .update(json!({"content": "declare \"t\" { z = 3 }"}))
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        assert_eq!(node.module_content("inner.t").unwrap(), " z = 3 ");
    }
}
