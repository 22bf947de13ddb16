// src/depend/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use super::expr::{DepExpr, parse};
use super::DependencyError;

/// Node of a compiled dependency graph.
///
/// Synthetic operator nodes are identified by the task whose expression
/// produced them plus a per-task counter, so ids are stable across recompiles
/// of an unchanged expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Task(String),
    And { owner: String, index: usize },
    Or { owner: String, index: usize },
}

impl NodeId {
    pub fn task(name: &str) -> Self {
        NodeId::Task(name.to_string())
    }

    pub fn is_synthetic(&self) -> bool {
        !matches!(self, NodeId::Task(_))
    }

    pub fn task_name(&self) -> Option<&str> {
        match self {
            NodeId::Task(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Task(name) => f.write_str(name),
            NodeId::And { owner, index } => write!(f, "&{owner}#{index}"),
            NodeId::Or { owner, index } => write!(f, "|{owner}#{index}"),
        }
    }
}

/// Adjacency map of one (block, version) scope.
///
/// Edges point from dependency toward dependent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeId) {
        self.adjacency.entry(node).or_default();
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.add_node(to.clone());
        self.adjacency.entry(from).or_default().insert(to);
    }

    fn remove_node(&mut self, node: &NodeId) {
        self.adjacency.remove(node);
        for succs in self.adjacency.values_mut() {
            succs.remove(node);
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.adjacency.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.adjacency.keys()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&NodeId, &NodeId)> {
        self.adjacency
            .iter()
            .flat_map(|(from, succs)| succs.iter().map(move |to| (from, to)))
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum()
    }

    pub fn successors(&self, node: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.adjacency.get(node).into_iter().flatten()
    }

    pub fn predecessors<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.adjacency
            .iter()
            .filter(move |(_, succs)| succs.contains(node))
            .map(|(from, _)| from)
    }

    pub fn synthetic_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes().filter(|n| n.is_synthetic())
    }

    /// Collapse operator nodes that have a single predecessor (or none) into
    /// their neighbours, so `"X"` and `"X&X"` end up with the same shape.
    fn prune(&mut self) {
        loop {
            let candidate = self.synthetic_nodes().find_map(|node| {
                let preds: Vec<NodeId> = self.predecessors(node).cloned().collect();
                (preds.len() <= 1).then(|| (node.clone(), preds))
            });

            let Some((node, preds)) = candidate else {
                break;
            };

            let succs: Vec<NodeId> = self.successors(&node).cloned().collect();
            self.remove_node(&node);
            if let Some(pred) = preds.into_iter().next() {
                for succ in succs {
                    self.add_edge(pred.clone(), succ);
                }
            }
        }
    }

    /// Task names in dependency order (dependencies first).
    ///
    /// Returns the first task found on a cycle if the graph is not a DAG.
    pub fn topological_tasks(&self) -> Result<Vec<String>, NodeId> {
        let mut graph: DiGraphMap<&NodeId, ()> = DiGraphMap::new();
        for node in self.nodes() {
            graph.add_node(node);
        }
        for (from, to) in self.edges() {
            graph.add_edge(from, to, ());
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .filter_map(|n| n.task_name().map(str::to_string))
                .collect()),
            Err(cycle) => Err(cycle.node_id().clone()),
        }
    }
}

/// Compile the expressions of one (block, version) into a graph.
///
/// Every token must name a key of `expr_by_task`; callers clean expressions
/// first. Operator nodes are always synthesized and then pruned.
pub fn compile(
    block: &str,
    version: &str,
    expr_by_task: &BTreeMap<String, String>,
) -> Result<DependencyGraph, DependencyError> {
    let mut graph = DependencyGraph::new();

    for task in expr_by_task.keys() {
        graph.add_node(NodeId::task(task));
    }

    for (task, raw) in expr_by_task {
        let expr = parse(raw)?;
        for dep in expr.task_names() {
            if !expr_by_task.contains_key(&dep) {
                return Err(DependencyError::UnknownTask {
                    block: block.to_string(),
                    version: version.to_string(),
                    task: task.clone(),
                    dependency: dep,
                });
            }
        }
        add_expression(&mut graph, task, &expr);
    }

    graph.prune();

    debug!(
        block,
        version,
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "compiled dependency graph"
    );

    Ok(graph)
}

fn add_expression(graph: &mut DependencyGraph, task: &str, expr: &DepExpr) {
    let target = NodeId::task(task);
    let mut and_index = 0;
    let mut or_index = 0;

    for condition in expr.conditions() {
        let or_node = NodeId::Or {
            owner: task.to_string(),
            index: or_index,
        };
        or_index += 1;

        let alternatives: &[DepExpr] = match condition {
            DepExpr::Or(alts) => alts,
            other => std::slice::from_ref(other),
        };

        for alt in alternatives {
            let and_node = NodeId::And {
                owner: task.to_string(),
                index: and_index,
            };
            and_index += 1;

            for member in alt.task_names() {
                graph.add_edge(NodeId::Task(member), and_node.clone());
            }
            graph.add_edge(and_node, or_node.clone());
        }

        graph.add_edge(or_node, target.clone());
    }
}

/// Whether the graph has no cycle.
pub fn validate_acyclic(graph: &DependencyGraph) -> bool {
    find_cycle(graph).is_none()
}

/// Depth-first search with a recursion stack; returns the node closing the
/// first back-edge found.
pub fn find_cycle(graph: &DependencyGraph) -> Option<NodeId> {
    fn visit<'a>(
        graph: &'a DependencyGraph,
        node: &'a NodeId,
        visited: &mut HashSet<&'a NodeId>,
        on_stack: &mut HashSet<&'a NodeId>,
    ) -> Option<NodeId> {
        visited.insert(node);
        on_stack.insert(node);
        for next in graph.successors(node) {
            if on_stack.contains(next) {
                return Some(next.clone());
            }
            if !visited.contains(next) {
                if let Some(found) = visit(graph, next, visited, on_stack) {
                    return Some(found);
                }
            }
        }
        on_stack.remove(node);
        None
    }

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    for node in graph.nodes() {
        if !visited.contains(node) {
            if let Some(found) = visit(graph, node, &mut visited, &mut on_stack) {
                return Some(found);
            }
        }
    }
    None
}

/// Every predecessor chain ending in `target`, root first.
///
/// Operator nodes are walked through but omitted from the returned paths.
/// A target with no predecessors yields no paths.
pub fn find_paths_to(graph: &DependencyGraph, target: &str) -> Vec<Vec<String>> {
    let start = NodeId::task(target);
    if !graph.contains(&start) {
        return Vec::new();
    }

    let mut paths: Vec<Vec<String>> = Vec::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut chain: Vec<NodeId> = vec![start.clone()];

    walk_back(graph, &mut chain, &mut |chain| {
        if chain.len() < 2 {
            return;
        }
        let path: Vec<String> = chain
            .iter()
            .rev()
            .filter_map(|n| n.task_name().map(str::to_string))
            .collect();
        if path.len() > 1 && seen.insert(path.clone()) {
            paths.push(path);
        }
    });

    paths
}

fn walk_back(graph: &DependencyGraph, chain: &mut Vec<NodeId>, emit: &mut dyn FnMut(&[NodeId])) {
    let Some(current) = chain.last().cloned() else {
        return;
    };
    let preds: Vec<NodeId> = graph
        .predecessors(&current)
        .filter(|p| !chain.contains(*p))
        .cloned()
        .collect();

    if preds.is_empty() {
        emit(chain.as_slice());
        return;
    }

    for pred in preds {
        chain.push(pred);
        walk_back(graph, chain, emit);
        chain.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exprs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn and_group_gets_one_join_node() {
        let g = compile("blk", "v1", &exprs(&[("X", ""), ("Y", ""), ("T", "X&Y")])).unwrap();
        let synth: Vec<&NodeId> = g.synthetic_nodes().collect();
        assert_eq!(synth.len(), 1);
        assert!(matches!(synth[0], NodeId::And { .. }));

        let preds: BTreeSet<String> = g.predecessors(synth[0]).map(|n| n.to_string()).collect();
        assert_eq!(preds, ["X", "Y"].iter().map(|s| s.to_string()).collect());
        let succs: Vec<&NodeId> = g.successors(synth[0]).collect();
        assert_eq!(succs, vec![&NodeId::task("T")]);
    }

    #[test]
    fn single_member_has_no_synthetic_node() {
        let g = compile("blk", "v1", &exprs(&[("X", ""), ("T", "X")])).unwrap();
        assert_eq!(g.synthetic_nodes().count(), 0);
        assert_eq!(g.successors(&NodeId::task("X")).collect::<Vec<_>>(), vec![&NodeId::task("T")]);
    }

    #[test]
    fn repeated_member_collapses_to_same_shape() {
        let a = compile("blk", "v1", &exprs(&[("X", ""), ("T", "X")])).unwrap();
        let b = compile("blk", "v1", &exprs(&[("X", ""), ("T", "X&X")])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = compile("blk", "v1", &exprs(&[("T", "missing")])).unwrap_err();
        assert!(matches!(err, DependencyError::UnknownTask { .. }));
    }

    #[test]
    fn mutual_dependency_is_a_cycle() {
        let g = compile("blk", "v1", &exprs(&[("A", "B"), ("B", "A")])).unwrap();
        assert!(!validate_acyclic(&g));
        assert!(g.topological_tasks().is_err());
    }

    #[test]
    fn paths_expand_operator_nodes() {
        let g = compile(
            "blk",
            "v1",
            &exprs(&[("X", ""), ("Y", ""), ("Z", ""), ("T", "X|Y,Z")]),
        )
        .unwrap();
        let mut paths = find_paths_to(&g, "T");
        paths.sort();
        assert_eq!(
            paths,
            vec![
                vec!["X".to_string(), "T".to_string()],
                vec!["Y".to_string(), "T".to_string()],
                vec!["Z".to_string(), "T".to_string()],
            ]
        );
    }

    #[test]
    fn paths_follow_chains() {
        let g = compile("blk", "v1", &exprs(&[("A", ""), ("B", "A"), ("C", "B")])).unwrap();
        assert_eq!(
            find_paths_to(&g, "C"),
            vec![vec!["A".to_string(), "B".to_string(), "C".to_string()]]
        );
        assert!(find_paths_to(&g, "A").is_empty());
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let g = compile("blk", "v1", &exprs(&[("A", ""), ("B", "A"), ("C", "A&B")])).unwrap();
        let order = g.topological_tasks().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("B") < pos("C"));
    }
}
