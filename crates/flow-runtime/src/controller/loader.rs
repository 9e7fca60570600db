//! Diff-based graph loading and topological evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flow_core::health::Health;
use flow_syntax::{references, Block, ParseError, Scope, Stmt, Value};
use serde_json::Map;
use tracing::{error, info, warn};

use super::dag::{topo_order, transitive_dependents, CycleError};
use super::node::{ComponentId, ExportSink, Node};
use super::node_component::ComponentNode;
use super::node_config::{ArgumentNode, ExportNode};
use super::node_custom::{CustomComponentNode, TemplateProvider};
use super::node_import::{ImportNode, ImportSink};
use super::scheduler::Scheduler;
use super::NodeGlobals;
use crate::import_source::SourceKind;
use crate::source::Source;

/// Errors that abort a load, leaving the running graph untouched.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The source text failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The reference edges form a cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// Two blocks materialize into the same node id.
    #[error("component `{0}` is declared more than once")]
    Duplicate(String),

    /// A block name matches no registered component, import kind, local
    /// declare, or import namespace.
    #[error("unrecognized component name `{0}`")]
    UnknownComponent(String),

    /// `argument`/`export` blocks outside a module.
    #[error("`{0}` blocks may only appear inside a module")]
    NotInModule(String),

    /// A block kind that needs a label is missing one.
    #[error("`{0}` blocks require a label")]
    MissingLabel(String),

    /// Attributes are not allowed at the top level of a source.
    #[error("attributes are not allowed at the top level of a configuration")]
    TopLevelAttribute,
}

/// Information about one managed node, for introspection surfaces.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Node id within this controller.
    pub id: String,
    /// The dotted block name for component nodes, or the node kind.
    pub name: String,
    /// Combined health.
    pub health: Health,
    /// Current exports, if the node kind produces any.
    pub exports: Option<Value>,
    /// Last evaluated arguments, for component nodes.
    pub arguments: Option<Value>,
    /// Opaque debug payload reported by the component, if any.
    pub debug_info: Option<Value>,
    /// When the node last successfully applied an update, if tracked.
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Default)]
struct LoaderState {
    nodes: BTreeMap<String, Node>,
    // dependency id -> ids of nodes that consume it
    dependents: BTreeMap<String, BTreeSet<String>>,
    // node id -> ids it consumes
    dependencies: BTreeMap<String, BTreeSet<String>>,
    topo: Vec<String>,
    topo_index: BTreeMap<String, usize>,
}

/// Owns the node set and performs diff-based applies and re-evaluation.
///
/// All structural mutation happens under one lock, held across a whole
/// apply or re-evaluation pass; nodes carry their own finer-grained locks
/// for state that components and sources touch concurrently.
pub(crate) struct Loader {
    globals: NodeGlobals,
    is_module: bool,
    export_sink: Option<ExportSink>,
    state: tokio::sync::Mutex<LoaderState>,
}

struct Candidate {
    nodes: BTreeMap<String, Node>,
    blocks: BTreeMap<String, Block>,
    reused: BTreeSet<String>,
    replaced: Vec<String>,
    namespaces: BTreeMap<String, String>,
    declares: BTreeMap<String, String>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
    topo: Vec<String>,
}

impl Loader {
    pub(crate) fn new(
        globals: NodeGlobals,
        is_module: bool,
        export_sink: Option<ExportSink>,
    ) -> Self {
        Self {
            globals,
            is_module,
            export_sink,
            state: tokio::sync::Mutex::new(LoaderState::default()),
        }
    }

    /// Apply a new source: diff against the current node set, stop removed
    /// nodes, evaluate everything topologically, and report which nodes
    /// should start running.
    ///
    /// Structural failures (parse shape, unknown names, cycles) abort
    /// before any running node is touched.
    pub(crate) async fn apply(
        &self,
        sched: &Scheduler,
        source: &Source,
        args: Option<Map<String, Value>>,
    ) -> Result<Vec<Node>, LoadError> {
        let mut state = self.state.lock().await;

        let candidate = self.build_candidate(&state, source)?;

        // Commit point: nothing below fails.
        let removed: Vec<String> = state
            .nodes
            .keys()
            .filter(|id| !candidate.nodes.contains_key(*id))
            .cloned()
            .collect();
        let mut to_stop = removed;
        to_stop.extend(candidate.replaced.iter().cloned());
        sched.stop(&to_stop).await;
        for id in &to_stop {
            if let Some(node) = state.nodes.get(id) {
                node.on_removed().await;
                info!(component = %id, "removed component");
            }
        }

        // Stash new blocks into reused nodes and (re-)wire module
        // templates now that the graph is final.
        for id in &candidate.reused {
            candidate.nodes[id]
                .set_block(candidate.blocks[id].clone())
                .await;
        }
        wire_templates(&candidate);

        state.nodes = candidate.nodes;
        state.dependents = candidate.dependents;
        state.dependencies = candidate.dependencies;
        state.topo_index = candidate
            .topo
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        state.topo = candidate.topo;

        if let Some(args) = args {
            self.bind_module_args(&state, &args);
        }

        // Topological evaluation; failures are local to the node.
        let mut eval_ok: BTreeMap<String, bool> = BTreeMap::new();
        for id in state.topo.clone() {
            let node = state.nodes[&id].clone();
            let scope = build_scope(&state, &id);
            let ok = match node.evaluate(&scope).await {
                Ok(()) => true,
                Err(err) => {
                    error!(component = %id, %err, "failed to evaluate component");
                    false
                }
            };
            eval_ok.insert(id, ok);
        }

        let mut started = Vec::new();
        for id in &state.topo {
            let node = &state.nodes[id];
            if node.is_runnable() && eval_ok[id] && !sched.is_running(id) {
                started.push(node.clone());
            }
        }
        Ok(started)
    }

    fn build_candidate(
        &self,
        state: &LoaderState,
        source: &Source,
    ) -> Result<Candidate, LoadError> {
        // Pass A: split the file into blocks, local declares, and import
        // namespaces, so later passes can classify custom components.
        let mut blocks = Vec::new();
        let mut declares: BTreeMap<String, String> = BTreeMap::new();
        let mut import_labels: BTreeSet<String> = BTreeSet::new();
        for stmt in &source.file().body {
            let Stmt::Block(block) = stmt else {
                return Err(LoadError::TopLevelAttribute);
            };
            let name = block.full_name();
            if name == "declare" {
                let label = label_of(block)?;
                if declares
                    .insert(label.clone(), block.body_text(source.text()).to_string())
                    .is_some()
                {
                    return Err(LoadError::Duplicate(format!("declare.{label}")));
                }
                continue;
            }
            if SourceKind::from_block_name(&name).is_some() {
                let label = label_of(block)?;
                if !import_labels.insert(label.clone()) {
                    return Err(LoadError::Duplicate(format!("import `{label}`")));
                }
            }
            blocks.push(block.clone());
        }

        // Pass B: construct or re-use one node per block.
        let mut nodes: BTreeMap<String, Node> = BTreeMap::new();
        let mut block_map: BTreeMap<String, Block> = BTreeMap::new();
        let mut namespaces: BTreeMap<String, String> = BTreeMap::new();
        let mut reused = BTreeSet::new();
        let mut replaced = Vec::new();
        for block in blocks {
            let id = ComponentId::from_block(&block);
            let key = id.as_str().to_string();
            let (node, was_reused) =
                self.make_node(state, &key, &block, &declares, &import_labels)?;
            if was_reused {
                reused.insert(key.clone());
            } else if state.nodes.contains_key(&key) {
                // Same id, different kind: the old instance must go.
                replaced.push(key.clone());
            }
            if let Node::Import(import) = &node {
                namespaces.insert(import.label().to_string(), key.clone());
            }
            if nodes.insert(key.clone(), node).is_some() {
                return Err(LoadError::Duplicate(key));
            }
            block_map.insert(key, block);
        }

        // Pass C: reference extraction into the edge set.
        let ids: BTreeSet<String> = nodes.keys().cloned().collect();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut add_edge =
            |from: String, to: String| {
                dependents.entry(from.clone()).or_default().insert(to.clone());
                dependencies.entry(to).or_default().insert(from);
            };
        for (key, block) in &block_map {
            for path in references(&block.body) {
                if let Some(dep) = resolve_reference(&ids, &path) {
                    add_edge(dep, key.clone());
                }
            }
            if matches!(nodes[key], Node::Custom(_)) {
                if let Some(import_id) = namespaces.get(&block.name[0]) {
                    add_edge(import_id.clone(), key.clone());
                }
            }
        }

        let topo = topo_order(&ids, &dependents)?;

        Ok(Candidate {
            nodes,
            blocks: block_map,
            reused,
            replaced,
            namespaces,
            declares,
            dependents,
            dependencies,
            topo,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn make_node(
        &self,
        state: &LoaderState,
        key: &str,
        block: &Block,
        declares: &BTreeMap<String, String>,
        import_labels: &BTreeSet<String>,
    ) -> Result<(Node, bool), LoadError> {
        let name = block.full_name();

        if let Some(kind) = SourceKind::from_block_name(&name) {
            label_of(block)?;
            if let Some(Node::Import(existing)) = state.nodes.get(key) {
                return Ok((Node::Import(existing.clone()), true));
            }
            let node = ImportNode::new(
                block.clone(),
                kind,
                self.globals.clone(),
                self.import_sink(),
            );
            return Ok((Node::Import(node), false));
        }

        if name == "argument" {
            if !self.is_module {
                return Err(LoadError::NotInModule(name));
            }
            label_of(block)?;
            if let Some(Node::Argument(existing)) = state.nodes.get(key) {
                return Ok((Node::Argument(existing.clone()), true));
            }
            let node = ArgumentNode::new(block.clone(), self.globals.on_node_update.clone());
            return Ok((Node::Argument(node), false));
        }

        if name == "export" {
            let Some(sink) = &self.export_sink else {
                return Err(LoadError::NotInModule(name));
            };
            label_of(block)?;
            if let Some(Node::Export(existing)) = state.nodes.get(key) {
                return Ok((Node::Export(existing.clone()), true));
            }
            let node = ExportNode::new(block.clone(), sink.clone());
            return Ok((Node::Export(node), false));
        }

        if let Some(build) = self.globals.components.get(&name) {
            if let Some(Node::Component(existing)) = state.nodes.get(key) {
                if existing.component_name() == name {
                    return Ok((Node::Component(existing.clone()), true));
                }
            }
            let node = ComponentNode::new(block.clone(), build, self.globals.clone());
            return Ok((Node::Component(node), false));
        }

        let is_custom = import_labels.contains(&block.name[0])
            || (block.name.len() == 1 && declares.contains_key(&block.name[0]));
        if is_custom {
            if let Some(Node::Custom(existing)) = state.nodes.get(key) {
                return Ok((Node::Custom(existing.clone()), true));
            }
            let node = CustomComponentNode::new(block.clone(), self.globals.clone());
            return Ok((Node::Custom(node), false));
        }

        Err(LoadError::UnknownComponent(name))
    }

    fn import_sink(&self) -> ImportSink {
        let notify = self.globals.on_node_update.clone();
        Arc::new(move |node: &Arc<ImportNode>| {
            notify(node.id().as_str());
        })
    }

    fn bind_module_args(&self, state: &LoaderState, args: &Map<String, Value>) {
        let labels: BTreeSet<&str> = state
            .nodes
            .values()
            .filter_map(|node| match node {
                Node::Argument(arg) => Some(arg.label()),
                _ => None,
            })
            .collect();
        for name in args.keys() {
            if !labels.contains(name.as_str()) {
                warn!(argument = %name, "value supplied for an argument the module does not declare");
            }
        }
        for node in state.nodes.values() {
            if let Node::Argument(arg) = node {
                arg.set_value(args.get(arg.label()).cloned());
            }
        }
    }

    /// Re-evaluate the transitive dependents of a dirty node, in
    /// topological order.
    pub(crate) async fn evaluate_dependents(&self, origin: &str) {
        let state = self.state.lock().await;
        if !state.nodes.contains_key(origin) {
            // Stale notification from a node removed by a later load.
            return;
        }
        let dependents = transitive_dependents(origin, &state.dependents);
        let mut ordered: Vec<String> = dependents
            .into_iter()
            .filter(|id| state.topo_index.contains_key(id))
            .collect();
        ordered.sort_by_key(|id| state.topo_index[id]);

        for id in ordered {
            let node = state.nodes[&id].clone();
            let scope = build_scope(&state, &id);
            if let Err(err) = node.evaluate(&scope).await {
                error!(component = %id, %err, "failed to re-evaluate component");
            }
        }
    }

    /// Update argument bindings from the module consumer.
    pub(crate) async fn update_module_args(&self, args: Map<String, Value>) {
        let state = self.state.lock().await;
        for node in state.nodes.values() {
            if let Node::Argument(arg) = node {
                arg.set_value(args.get(arg.label()).cloned());
            }
        }
    }

    /// Drop every node, releasing per-node resources.
    pub(crate) async fn remove_all(&self) {
        let nodes: Vec<Node> = {
            let mut state = self.state.lock().await;
            let nodes = state.nodes.values().cloned().collect();
            *state = LoaderState::default();
            nodes
        };
        for node in nodes {
            node.on_removed().await;
        }
    }

    pub(crate) async fn node_count(&self) -> usize {
        self.state.lock().await.nodes.len()
    }

    pub(crate) async fn get_export(&self, id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.nodes.get(id).and_then(Node::exports_for_scope)
    }

    pub(crate) async fn component_infos(&self) -> Vec<ComponentInfo> {
        let state = self.state.lock().await;
        let mut infos = Vec::with_capacity(state.nodes.len());
        for (id, node) in &state.nodes {
            let (name, arguments, debug_info) = match node {
                Node::Component(component) => (
                    component.component_name().to_string(),
                    Some(component.arguments().await),
                    component.debug_info().await,
                ),
                other => (other.kind().to_string(), None, None),
            };
            infos.push(ComponentInfo {
                id: id.clone(),
                name,
                health: node.health(),
                exports: node.exports_for_scope(),
                arguments,
                debug_info,
                last_updated: node.last_updated(),
            });
        }
        infos
    }
}

fn label_of(block: &Block) -> Result<String, LoadError> {
    block
        .label
        .clone()
        .ok_or_else(|| LoadError::MissingLabel(block.full_name()))
}

/// Resolve a reference path to the most specific node id it prefixes.
fn resolve_reference(ids: &BTreeSet<String>, path: &[String]) -> Option<String> {
    for len in (1..=path.len()).rev() {
        let key = path[..len].join(".");
        if ids.contains(&key) {
            return Some(key);
        }
    }
    None
}

fn wire_templates(candidate: &Candidate) {
    for (key, node) in &candidate.nodes {
        let Node::Custom(custom) = node else {
            continue;
        };
        let block = &candidate.blocks[key];
        if let Some(import_id) = candidate.namespaces.get(&block.name[0]) {
            if let Some(Node::Import(import)) = candidate.nodes.get(import_id) {
                custom.set_provider(TemplateProvider::Import {
                    node: Arc::downgrade(import),
                    path: block.name[1..].join("."),
                });
            }
        } else if let Some(content) = candidate.declares.get(&block.name[0]) {
            custom.set_provider(TemplateProvider::Local { content: content.clone() });
        }
    }
}

fn build_scope(state: &LoaderState, id: &str) -> Scope<'static> {
    let mut scope = Scope::root();
    let Some(deps) = state.dependencies.get(id) else {
        return scope;
    };
    for dep in deps {
        let Some(node) = state.nodes.get(dep) else {
            continue;
        };
        if let Some(exports) = node.exports_for_scope() {
            scope.insert_nested(node.id().segments(), exports);
        }
    }
    scope
}
