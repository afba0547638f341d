//! Ancestry graph over split/transplant lineage.
//!
//! Nodes are batches; edges are parent→child links from two sources:
//! each batch's `transplanted_from` back-reference, and TRANSPLANT_USED
//! audit events, which is where a transplant's *second* source shows up
//! (the batch row only stores the primary parent). A parent id with no
//! matching batch becomes a ghost node so callers can render the
//! data-integrity gap instead of the traversal failing. Cycles are a
//! data-integrity error and are reported, never looped.
//!
//! Read-only: nothing here mutates batch records.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use potline_core::ServiceError;
use serde::Serialize;

use crate::model::{Batch, BatchEvent, BatchStatus, EventType, Phase};

use super::{BatchService, codec_err, store_err};

/// One node in the lineage graph.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AncestryNode {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    /// True when the id was referenced as a parent but no batch record
    /// exists for it.
    pub ghost: bool,
}

impl AncestryNode {
    fn from_batch(b: &Batch) -> Self {
        Self {
            id: b.id.clone(),
            batch_number: Some(b.batch_number.clone()),
            phase: Some(b.phase),
            status: Some(b.status),
            quantity: Some(b.quantity),
            ghost: false,
        }
    }

    fn ghost(id: &str) -> Self {
        Self {
            id: id.to_string(),
            batch_number: None,
            phase: None,
            status: None,
            quantity: None,
            ghost: true,
        }
    }
}

/// A descendant subtree rooted at one node.
#[derive(Debug, Clone, Serialize)]
pub struct AncestryTree {
    #[serde(flatten)]
    pub node: AncestryNode,
    pub children: Vec<AncestryTree>,
}

/// Arena of nodes plus parent/child adjacency for one tenant.
struct Graph {
    nodes: HashMap<String, AncestryNode>,
    parents: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
}

impl BatchService {
    fn build_graph(&self, org: &str) -> Result<Graph, ServiceError> {
        let mut nodes: HashMap<String, AncestryNode> = HashMap::new();
        let mut edges: BTreeSet<(String, String)> = BTreeSet::new();

        let batches = self
            .kv
            .scan(&format!("batch:{}:", org))
            .map_err(store_err)?;
        for (_key, data) in batches {
            let b: Batch = serde_json::from_slice(&data).map_err(codec_err)?;
            if let Some(ref parent) = b.transplanted_from {
                edges.insert((parent.clone(), b.id.clone()));
            }
            nodes.insert(b.id.clone(), AncestryNode::from_batch(&b));
        }

        // Secondary edges from the audit stream.
        let events = self
            .kv
            .scan(&format!("event:{}:", org))
            .map_err(store_err)?;
        for (_key, data) in events {
            let ev: BatchEvent = serde_json::from_slice(&data).map_err(codec_err)?;
            if ev.event_type != EventType::TransplantUsed {
                continue;
            }
            if let Some(child) = ev.payload.get("newBatchId").and_then(|v| v.as_str()) {
                edges.insert((ev.batch_id.clone(), child.to_string()));
            }
        }

        // Ghost nodes for dangling references.
        for (parent, child) in &edges {
            for id in [parent, child] {
                if !nodes.contains_key(id) {
                    nodes.insert(id.clone(), AncestryNode::ghost(id));
                }
            }
        }

        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, child) in edges {
            parents.entry(child.clone()).or_default().push(parent.clone());
            children.entry(parent).or_default().push(child);
        }

        Ok(Graph { nodes, parents, children })
    }

    /// All ancestors of a batch, nearest first (breadth-first over
    /// parent edges). Fails if the batch is unknown or its lineage
    /// contains a cycle.
    pub fn ancestors_of(
        &self,
        org: &str,
        batch_id: &str,
    ) -> Result<Vec<AncestryNode>, ServiceError> {
        let graph = self.build_graph(org)?;
        if !graph.nodes.contains_key(batch_id) {
            return Err(ServiceError::NotFound(format!("batch {} not found", batch_id)));
        }
        detect_cycle(batch_id, &graph.parents)?;

        let mut out = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([batch_id]);
        let mut queue: VecDeque<&str> = VecDeque::from([batch_id]);
        while let Some(id) = queue.pop_front() {
            if let Some(parents) = graph.parents.get(id) {
                for parent in parents {
                    if visited.insert(parent.as_str()) {
                        out.push(graph.nodes[parent.as_str()].clone());
                        queue.push_back(parent.as_str());
                    }
                }
            }
        }
        Ok(out)
    }

    /// The descendant tree rooted at a batch. Diamonds (a child reached
    /// through both transplant sources) appear once per parent; cycles
    /// are an error.
    pub fn descendants_of(
        &self,
        org: &str,
        batch_id: &str,
    ) -> Result<AncestryTree, ServiceError> {
        let graph = self.build_graph(org)?;
        if !graph.nodes.contains_key(batch_id) {
            return Err(ServiceError::NotFound(format!("batch {} not found", batch_id)));
        }
        detect_cycle(batch_id, &graph.children)?;
        Ok(build_tree(batch_id, &graph))
    }
}

fn build_tree(id: &str, graph: &Graph) -> AncestryTree {
    let children = graph
        .children
        .get(id)
        .map(|kids| kids.iter().map(|c| build_tree(c, graph)).collect())
        .unwrap_or_default();
    AncestryTree {
        node: graph.nodes[id].clone(),
        children,
    }
}

/// Depth-first reachability check: no node may be reachable from itself
/// through `adjacency`. Uses an explicit stack with an on-path set.
fn detect_cycle(
    start: &str,
    adjacency: &HashMap<String, Vec<String>>,
) -> Result<(), ServiceError> {
    enum Step<'a> {
        Enter(&'a str),
        Leave(&'a str),
    }

    let mut on_path: HashSet<&str> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();
    let mut stack = vec![Step::Enter(start)];

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(id) => {
                if on_path.contains(id) {
                    return Err(ServiceError::Internal(format!(
                        "ancestry cycle detected involving batch {}",
                        id
                    )));
                }
                if !done.insert(id) {
                    continue;
                }
                on_path.insert(id);
                stack.push(Step::Leave(id));
                if let Some(next) = adjacency.get(id) {
                    for n in next {
                        if on_path.contains(n.as_str()) {
                            return Err(ServiceError::Internal(format!(
                                "ancestry cycle detected involving batch {}",
                                n
                            )));
                        }
                        stack.push(Step::Enter(n.as_str()));
                    }
                }
            }
            Step::Leave(id) => {
                on_path.remove(id);
            }
        }
    }
    Ok(())
}

/// Compact edge listing used by integrity reports.
pub fn edge_list(tree: &AncestryTree) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    collect_edges(tree, &mut out);
    out
}

fn collect_edges(tree: &AncestryTree, out: &mut BTreeMap<String, Vec<String>>) {
    let kids: Vec<String> = tree.children.iter().map(|c| c.node.id.clone()).collect();
    if !kids.is_empty() {
        out.entry(tree.node.id.clone()).or_default().extend(kids);
    }
    for child in &tree.children {
        collect_edges(child, out);
    }
}
