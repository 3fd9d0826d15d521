//! Turning a registry and a set of targets into an execution plan.
//!
//! The plan is computed in three steps:
//!
//! 1. **Closure**: starting from the targets, follow `depends_on` and
//!    `finalized_by` edges. `should_run_after` edges are not followed, a task
//!    reachable only through them stays out of the plan.
//! 2. **Validation**: cycles over hard edges alone are reported first, then
//!    cycles that need ordering edges. Both are fatal.
//! 3. **Ordering**: Kahn's algorithm over every edge kind, always picking the
//!    ready task that was declared first. The same registry and targets give
//!    the same order on every invocation.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{CycleKind, GraphError};
use crate::registry::Registry;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// `depends_on`, points from the dependency to the dependent.
    Hard,
    /// `should_run_after`, points from the earlier task to the later one.
    Soft,
    /// `finalized_by`, points from the finalized task to its finalizer.
    Finalizer,
}

/// What to run: the requested targets and the tasks to leave out.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub targets: Vec<TaskId>,
    pub excluded: Vec<TaskId>,
}

impl Selection {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            excluded: Vec::new(),
        }
    }

    /// Leaves a task out of the closure, its own dependencies are not
    /// followed and dependents treat it as satisfied.
    pub fn exclude<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.excluded.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// A validated, ordered subgraph of the registry.
#[derive(Debug)]
pub struct Plan {
    pub(crate) graph: DiGraph<TaskId, EdgeKind>,
    order: Vec<NodeIndex>,
}

impl Plan {
    /// Task ids in execution order, each exactly once.
    pub fn order(&self) -> Vec<TaskId> {
        self.order.iter().map(|&i| self.graph[i].clone()).collect()
    }

    pub(crate) fn indices(&self) -> &[NodeIndex] {
        &self.order
    }

    pub fn contains(&self, id: &str) -> bool {
        self.graph.node_weights().any(|n| n.as_ref() == id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Incoming edges of a node: the tasks that must finish before it.
    pub(crate) fn predecessors(
        &self,
        index: NodeIndex,
    ) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
    }

    pub(crate) fn successors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }
}

impl fmt::Display for Plan {
    /// Renders the plan as a Mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for &index in &self.order {
            let name = self.graph[index].replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            let arrow = match edge.weight() {
                EdgeKind::Hard => "-->",
                EdgeKind::Soft => "-.->",
                EdgeKind::Finalizer => "==>",
            };
            writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Plain ordering contract: the ids to run for `targets`, in order.
pub fn schedule_order<I, S>(registry: &Registry, targets: I) -> Result<Vec<TaskId>, GraphError>
where
    I: IntoIterator<Item = S>,
    S: Into<TaskId>,
{
    Ok(schedule(registry, &Selection::new(targets))?.order())
}

pub fn schedule(registry: &Registry, selection: &Selection) -> Result<Plan, GraphError> {
    for id in selection.targets.iter().chain(&selection.excluded) {
        if registry.get(id).is_none() {
            return Err(GraphError::UnknownTask(id.clone()));
        }
    }

    let members = closure(registry, selection);

    // Nodes are added in declaration order so that index order doubles as the
    // tie breaker.
    let mut members: Vec<_> = members.into_iter().collect();
    members.sort_by_key(|id| registry.position(id));

    let mut graph = DiGraph::with_capacity(members.len(), members.len());
    let mut nodes = HashMap::with_capacity(members.len());

    for id in &members {
        nodes.insert(id.clone(), graph.add_node(id.clone()));
    }

    for id in &members {
        let Some(task) = registry.get(id) else {
            continue;
        };
        let index = nodes[id];

        for dep in task.hard_deps() {
            if let Some(&from) = nodes.get(dep) {
                graph.add_edge(from, index, EdgeKind::Hard);
            }
        }
        for dep in task.soft_deps() {
            if let Some(&from) = nodes.get(dep) {
                graph.add_edge(from, index, EdgeKind::Soft);
            }
        }
        for fin in task.finalizers() {
            if let Some(&to) = nodes.get(fin) {
                graph.add_edge(index, to, EdgeKind::Finalizer);
            }
        }
    }

    let hard = graph.filter_map(
        |_, id| Some(id.clone()),
        |_, kind| (*kind == EdgeKind::Hard).then_some(*kind),
    );
    if let Some(tasks) = find_cycle(&hard) {
        return Err(GraphError::Cycle {
            kind: CycleKind::Hard,
            tasks,
        });
    }
    if let Some(tasks) = find_cycle(&graph) {
        return Err(GraphError::Cycle {
            kind: CycleKind::Ordering,
            tasks,
        });
    }

    let order = toposort_stable(&graph);

    tracing::debug!(
        "planned {} task(s): {}",
        order.len(),
        order
            .iter()
            .map(|&i| graph[i].as_ref())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(Plan { graph, order })
}

/// Every task the targets need, following hard edges and finalizers.
fn closure(registry: &Registry, selection: &Selection) -> HashSet<TaskId> {
    let excluded: HashSet<&TaskId> = selection.excluded.iter().collect();
    let mut visited = HashSet::new();
    let mut queue: VecDeque<TaskId> = selection
        .targets
        .iter()
        .filter(|id| !excluded.contains(id))
        .cloned()
        .collect();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id.clone()) {
            continue;
        }

        let Some(task) = registry.get(&id) else {
            continue;
        };

        for next in task.hard_deps().iter().chain(task.finalizers()) {
            if !excluded.contains(next) && !visited.contains(next) {
                queue.push_back(next.clone());
            }
        }
    }

    visited
}

fn find_cycle(graph: &DiGraph<TaskId, EdgeKind>) -> Option<Vec<TaskId>> {
    for mut scc in tarjan_scc(graph) {
        let looped = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
        if scc.len() > 1 || looped {
            scc.sort();
            return Some(scc.into_iter().map(|i| graph[i].clone()).collect());
        }
    }

    None
}

/// Kahn's algorithm, the smallest ready index (earliest declared) goes first.
fn toposort_stable(graph: &DiGraph<TaskId, EdgeKind>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.edges_directed(i, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| in_degree[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());

    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);

        for edge in graph.edges_directed(index, Direction::Outgoing) {
            let target = edge.target();
            in_degree[target.index()] -= 1;
            if in_degree[target.index()] == 0 {
                ready.push(Reverse(target));
            }
        }
    }

    order
}
