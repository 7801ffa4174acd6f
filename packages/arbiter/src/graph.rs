//! Dependency DAG.
//!
//! Built from the plan on every scheduling pass. Detects cycles (items
//! in a cycle are reported and excluded, the rest keep scheduling) and
//! computes critical-path membership by longest weighted path, with
//! estimated minutes as weights.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use mergeflow_types::{ColdState, WorkItem};

/// Dependency structure over one plan snapshot.
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    weights: HashMap<String, u32>,
    cycles: Vec<Vec<String>>,
    cyclic_members: HashSet<String>,
    critical_members: HashSet<String>,
    /// Dependencies naming ids absent from the plan.
    missing: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build from the current plan items. Edges run dependency -> dependent.
    pub fn build(items: &[WorkItem]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut weights = HashMap::new();

        for item in items {
            let node = graph.add_node(item.id.clone());
            index.insert(item.id.clone(), node);
            weights.insert(item.id.clone(), item.complexity.estimated_minutes.max(1));
        }

        let mut missing: HashMap<String, Vec<String>> = HashMap::new();
        for item in items {
            for dep in &item.dependencies {
                match index.get(dep) {
                    Some(&dep_node) => {
                        graph.add_edge(dep_node, index[&item.id], ());
                    }
                    None => {
                        missing.entry(item.id.clone()).or_default().push(dep.clone());
                    }
                }
            }
        }

        let cycles = find_cycles(&graph);
        let cyclic_members: HashSet<String> = cycles.iter().flatten().cloned().collect();
        let critical_members = if cycles.is_empty() {
            critical_path_members(&graph, &weights)
        } else {
            // Longest-path is undefined under a cycle; skip until fixed.
            HashSet::new()
        };

        Self {
            graph,
            index,
            weights,
            cycles,
            cyclic_members,
            critical_members,
            missing,
        }
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Each detected cycle as a list of member ids.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn in_cycle(&self, id: &str) -> bool {
        self.cyclic_members.contains(id)
    }

    /// Whether the item sits on a longest weighted dependency chain.
    pub fn on_critical_path(&self, id: &str) -> bool {
        self.critical_members.contains(id)
    }

    /// Dependencies referencing unknown items, per dependent.
    pub fn missing_dependencies(&self) -> &HashMap<String, Vec<String>> {
        &self.missing
    }

    /// All dependencies present, known, and satisfied (completed or
    /// approved).
    pub fn deps_satisfied(&self, item: &WorkItem, cold_of: &HashMap<String, ColdState>) -> bool {
        if self.missing.contains_key(&item.id) {
            return false;
        }
        item.dependencies.iter().all(|dep| {
            cold_of
                .get(dep)
                .map(|state| state.satisfies_dependency())
                .unwrap_or(false)
        })
    }

    /// Direct dependents of an item.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        match self.index.get(id) {
            Some(&node) => self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| self.graph[e.target()].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

fn find_cycles(graph: &DiGraph<String, ()>) -> Vec<Vec<String>> {
    petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|scc| {
            scc.len() > 1
                || scc
                    .first()
                    .map(|&n| graph.find_edge(n, n).is_some())
                    .unwrap_or(false)
        })
        .map(|scc| {
            let mut ids: Vec<String> = scc.into_iter().map(|n| graph[n].clone()).collect();
            ids.sort();
            ids
        })
        .collect()
}

/// Nodes lying on at least one maximum-weight path. `down[n]` is the
/// heaviest chain starting at n, `up[n]` the heaviest ending at n (both
/// inclusive); n is critical iff `up[n] + down[n] - w[n]` hits the
/// global maximum.
fn critical_path_members(
    graph: &DiGraph<String, ()>,
    weights: &HashMap<String, u32>,
) -> HashSet<String> {
    let order = match petgraph::algo::toposort(graph, None) {
        Ok(order) => order,
        Err(_) => return HashSet::new(),
    };

    let w = |n: NodeIndex| -> u64 { u64::from(*weights.get(&graph[n]).unwrap_or(&1)) };

    let mut down: HashMap<NodeIndex, u64> = HashMap::new();
    for &node in order.iter().rev() {
        let best_child = graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|c| down[&c])
            .max()
            .unwrap_or(0);
        down.insert(node, w(node) + best_child);
    }

    let mut up: HashMap<NodeIndex, u64> = HashMap::new();
    for &node in &order {
        let best_parent = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|p| up[&p])
            .max()
            .unwrap_or(0);
        up.insert(node, w(node) + best_parent);
    }

    let longest = order.iter().map(|n| down[n]).max().unwrap_or(0);
    order
        .into_iter()
        .filter(|&n| up[&n] + down[&n] - w(n) == longest)
        .map(|n| graph[n].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergeflow_types::Complexity;

    fn item(id: &str, deps: &[&str], minutes: u32) -> WorkItem {
        let mut item = WorkItem::new(id, id)
            .with_dependencies(deps.iter().map(|d| (*d).to_string()).collect());
        item.complexity = Complexity {
            estimated_minutes: minutes,
            ..Complexity::default()
        };
        item
    }

    #[test]
    fn test_cycle_detection() {
        let items = vec![
            item("A", &["B"], 10),
            item("B", &["A"], 10),
            item("C", &[], 10),
        ];
        let graph = DependencyGraph::build(&items);

        assert!(graph.has_cycles());
        assert_eq!(graph.cycles(), &[vec!["A".to_string(), "B".to_string()]]);
        assert!(graph.in_cycle("A"));
        assert!(graph.in_cycle("B"));
        assert!(!graph.in_cycle("C"));
    }

    #[test]
    fn test_no_false_cycle_on_diamond() {
        let items = vec![
            item("A", &[], 10),
            item("B", &["A"], 10),
            item("C", &["A"], 10),
            item("D", &["B", "C"], 10),
        ];
        let graph = DependencyGraph::build(&items);
        assert!(!graph.has_cycles());
    }

    #[test]
    fn test_critical_path_prefers_heavy_chain() {
        // A(10) -> B(60) -> D(10); A -> C(5). Critical chain is A-B-D.
        let items = vec![
            item("A", &[], 10),
            item("B", &["A"], 60),
            item("C", &["A"], 5),
            item("D", &["B"], 10),
        ];
        let graph = DependencyGraph::build(&items);

        assert!(graph.on_critical_path("A"));
        assert!(graph.on_critical_path("B"));
        assert!(graph.on_critical_path("D"));
        assert!(!graph.on_critical_path("C"));
    }

    #[test]
    fn test_deps_satisfied() {
        let items = vec![item("A", &[], 10), item("B", &["A"], 10)];
        let graph = DependencyGraph::build(&items);

        let mut cold = HashMap::from([
            ("A".to_string(), ColdState::InProgress),
            ("B".to_string(), ColdState::New),
        ]);
        assert!(!graph.deps_satisfied(&items[1], &cold));

        cold.insert("A".to_string(), ColdState::Completed);
        assert!(graph.deps_satisfied(&items[1], &cold));

        cold.insert("A".to_string(), ColdState::Approved);
        assert!(graph.deps_satisfied(&items[1], &cold));
    }

    #[test]
    fn test_missing_dependency_blocks() {
        let items = vec![item("B", &["GHOST"], 10)];
        let graph = DependencyGraph::build(&items);

        assert!(graph.missing_dependencies().contains_key("B"));
        let cold = HashMap::from([("B".to_string(), ColdState::Ready)]);
        assert!(!graph.deps_satisfied(&items[0], &cold));
    }

    #[test]
    fn test_dependents() {
        let items = vec![
            item("A", &[], 10),
            item("B", &["A"], 10),
            item("C", &["A"], 10),
        ];
        let graph = DependencyGraph::build(&items);
        let mut deps = graph.dependents("A");
        deps.sort();
        assert_eq!(deps, vec!["B".to_string(), "C".to_string()]);
    }
}
