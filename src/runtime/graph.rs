/// Petgraph view of a workflow's connections
///
/// Traversal itself is a plain FIFO walk in the engine; this graph is only
/// used to report structural problems before a run starts.
use crate::workflow::types::Workflow;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct WorkflowGraph {
    /// Node weights are node names, edge weights the optional `when` condition
    graph: DiGraph<String, Option<String>>,
    name_to_index: HashMap<String, NodeIndex>,
    /// Rule targets that name no declared node, as `(source, target)`
    dangling: Vec<(String, String)>,
}

impl WorkflowGraph {
    pub fn build(workflow: &Workflow) -> Self {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();
        let mut dangling = Vec::new();

        for node in &workflow.nodes {
            name_to_index
                .entry(node.name.clone())
                .or_insert_with(|| graph.add_node(node.name.clone()));
        }

        // iterate in node order so diagnostics come out deterministic
        for node in &workflow.nodes {
            let Some(&source) = name_to_index.get(&node.name) else {
                continue;
            };
            for rule in workflow.outgoing(&node.name).iter().flatten() {
                match name_to_index.get(&rule.node) {
                    Some(&target) => {
                        graph.add_edge(source, target, rule.when.clone());
                    }
                    None => dangling.push((node.name.clone(), rule.node.clone())),
                }
            }
        }

        for source in workflow.connections.keys() {
            if !name_to_index.contains_key(source) {
                tracing::debug!("⚠️ Connections declared for unknown node '{}'", source);
            }
        }

        Self {
            graph,
            name_to_index,
            dangling,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn dangling_targets(&self) -> &[(String, String)] {
        &self.dangling
    }

    /// Names of nodes no start node can reach, in declaration order
    pub fn unreachable_from(&self, starts: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        for start in starts {
            let Some(&index) = self.name_to_index.get(start) else {
                continue;
            };
            let mut bfs = Bfs::new(&self.graph, index);
            while let Some(visited) = bfs.next(&self.graph) {
                seen.insert(visited);
            }
        }

        self.graph
            .node_indices()
            .filter(|index| !seen.contains(index))
            .map(|index| self.graph[index].clone())
            .collect()
    }

    /// Human-readable warnings for the run log
    pub fn diagnostics(&self, starts: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();

        for (source, target) in &self.dangling {
            warnings.push(format!("connection {source} -> {target} targets an unknown node"));
        }
        if self.is_cyclic() {
            warnings.push("connection graph contains a cycle; each node still runs at most once".to_string());
        }
        let unreachable = self.unreachable_from(starts);
        if !unreachable.is_empty() {
            warnings.push(format!("nodes unreachable from start: {}", unreachable.join(", ")));
        }

        warnings
    }
}
