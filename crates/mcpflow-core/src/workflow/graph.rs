//! Step dependency graph: topological ordering, cycle detection, grouping.
//!
//! Uses `petgraph` to model data/control connections as a directed graph.
//! Error and conditional connections never order execution and are left out.
//! Connections whose endpoints are unknown are ignored here; the validator
//! reports them separately.

use std::collections::{HashMap, VecDeque};

use mcpflow_types::workflow::{ConnectionType, WorkflowDefinition, WorkflowStep};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed graph of steps joined by data/control connections.
pub struct DependencyGraph<'a> {
    graph: DiGraph<&'a str, ConnectionType>,
    index: HashMap<&'a str, NodeIndex>,
}

/// DFS node state for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    OnStack,
    Done,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph in step definition order.
    pub fn new(def: &'a WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for step in &def.steps {
            index
                .entry(step.id.as_str())
                .or_insert_with(|| graph.add_node(step.id.as_str()));
        }

        for conn in &def.connections {
            if !conn.connection_type.is_dependency() {
                continue;
            }
            let (Some(&from), Some(&to)) = (
                index.get(conn.source_step_id.as_str()),
                index.get(conn.target_step_id.as_str()),
            ) else {
                continue;
            };
            graph.add_edge(from, to, conn.connection_type);
        }

        Self { graph, index }
    }

    /// Outgoing neighbours in connection order.
    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self.graph.edges_directed(node, Direction::Outgoing).collect();
        edges.sort_by_key(|e| e.id());
        edges.into_iter().map(|e| e.target()).collect()
    }

    /// Kahn's algorithm with the ready queue seeded in definition order.
    ///
    /// Steps that sit on a cycle never reach in-degree zero and are left out.
    pub fn topological_order(&self) -> Vec<&'a str> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.edges_directed(n, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = queue.pop_front() {
            order.push(self.graph[node]);
            for next in self.successors(node) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Depth-first search for a back edge to a node still on the stack.
    pub fn has_cycle(&self) -> bool {
        let mut state = vec![Visit::Unvisited; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if state[root.index()] != Visit::Unvisited {
                continue;
            }

            // Explicit stack of (node, successors, next successor position).
            let mut stack = vec![(root, self.successors(root), 0usize)];
            state[root.index()] = Visit::OnStack;

            while let Some((node, succ, pos)) = stack.last_mut() {
                if let Some(&next) = succ.get(*pos) {
                    *pos += 1;
                    match state[next.index()] {
                        Visit::OnStack => return true,
                        Visit::Unvisited => {
                            state[next.index()] = Visit::OnStack;
                            let next_succ = self.successors(next);
                            stack.push((next, next_succ, 0));
                        }
                        Visit::Done => {}
                    }
                } else {
                    state[node.index()] = Visit::Done;
                    stack.pop();
                }
            }
        }
        false
    }

    /// Data/control predecessors of a step.
    pub fn predecessors(&self, step_id: &str) -> Vec<&'a str> {
        let Some(&node) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut preds: Vec<&'a str> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    }
}

// ---------------------------------------------------------------------------
// Parallel groups
// ---------------------------------------------------------------------------

/// Partition steps by `parallel_group`.
///
/// Tagged groups come first, in order of first appearance; untagged steps
/// (including blank tags) form one trailing group. Within a group,
/// definition order is kept.
pub fn parallel_groups(steps: &[WorkflowStep]) -> Vec<Vec<&WorkflowStep>> {
    let mut tags: Vec<&str> = Vec::new();
    let mut grouped: HashMap<&str, Vec<&WorkflowStep>> = HashMap::new();
    let mut ungrouped = Vec::new();

    for step in steps {
        match step.parallel_group.as_deref().filter(|tag| !tag.trim().is_empty()) {
            Some(tag) => {
                if !grouped.contains_key(tag) {
                    tags.push(tag);
                }
                grouped.entry(tag).or_default().push(step);
            }
            None => ungrouped.push(step),
        }
    }

    let mut groups: Vec<Vec<&WorkflowStep>> = tags
        .into_iter()
        .filter_map(|tag| grouped.remove(tag))
        .collect();
    if !ungrouped.is_empty() {
        groups.push(ungrouped);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpflow_types::workflow::WorkflowConnection;

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, id.to_uppercase(), "echo")
    }

    fn workflow(ids: &[&str], edges: &[(&str, &str, ConnectionType)]) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("graph");
        def.steps = ids.iter().map(|id| step(id)).collect();
        def.connections = edges
            .iter()
            .enumerate()
            .map(|(i, (s, t, ty))| WorkflowConnection::new(format!("c{i}"), *s, *t, *ty))
            .collect();
        def
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let def = workflow(
            &["save", "transform", "fetch"],
            &[
                ("fetch", "transform", ConnectionType::Data),
                ("transform", "save", ConnectionType::Data),
            ],
        );
        let graph = DependencyGraph::new(&def);
        assert_eq!(graph.topological_order(), vec!["fetch", "transform", "save"]);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn independent_steps_keep_definition_order() {
        let def = workflow(&["b", "a", "c"], &[]);
        let graph = DependencyGraph::new(&def);
        assert_eq!(graph.topological_order(), vec!["b", "a", "c"]);
    }

    #[test]
    fn diamond_orders_after_both_parents() {
        let def = workflow(
            &["root", "left", "right", "join"],
            &[
                ("root", "left", ConnectionType::Data),
                ("root", "right", ConnectionType::Control),
                ("left", "join", ConnectionType::Data),
                ("right", "join", ConnectionType::Data),
            ],
        );
        let order = DependencyGraph::new(&def).topological_order();
        assert_eq!(order, vec!["root", "left", "right", "join"]);
    }

    #[test]
    fn three_cycle_detected_in_any_insertion_order() {
        let edges = [
            ("a", "b", ConnectionType::Data),
            ("b", "c", ConnectionType::Data),
            ("c", "a", ConnectionType::Data),
        ];
        for rotation in 0..3 {
            let mut rotated = edges.to_vec();
            rotated.rotate_left(rotation);
            let def = workflow(&["a", "b", "c"], &rotated);
            let graph = DependencyGraph::new(&def);
            assert!(graph.has_cycle(), "rotation {rotation}");
            assert!(graph.topological_order().is_empty());
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let def = workflow(&["a"], &[("a", "a", ConnectionType::Control)]);
        assert!(DependencyGraph::new(&def).has_cycle());
    }

    #[test]
    fn error_edges_do_not_form_cycles() {
        let def = workflow(
            &["a", "b"],
            &[
                ("a", "b", ConnectionType::Data),
                ("b", "a", ConnectionType::Error),
            ],
        );
        let graph = DependencyGraph::new(&def);
        assert!(!graph.has_cycle());
        assert_eq!(graph.predecessors("a"), Vec::<&str>::new());
        assert_eq!(graph.predecessors("b"), vec!["a"]);
    }

    #[test]
    fn unknown_endpoints_are_ignored() {
        let def = workflow(&["a"], &[("a", "ghost", ConnectionType::Data)]);
        let graph = DependencyGraph::new(&def);
        assert_eq!(graph.topological_order(), vec!["a"]);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn groups_in_first_appearance_order_with_trailing_ungrouped() {
        let mut steps = vec![step("x"), step("a"), step("b"), step("c"), step("d")];
        steps[1].parallel_group = Some("g2".to_string());
        steps[2].parallel_group = Some("g1".to_string());
        steps[3].parallel_group = Some("g2".to_string());

        let groups = parallel_groups(&steps);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"], vec!["x", "d"]]);
    }

    #[test]
    fn blank_tags_are_ungrouped() {
        let mut steps = vec![step("a"), step("b"), step("c")];
        steps[0].parallel_group = Some(String::new());
        steps[1].parallel_group = Some("g".to_string());
        steps[2].parallel_group = Some("  ".to_string());

        let groups = parallel_groups(&steps);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["b"], vec!["a", "c"]]);
    }
}
