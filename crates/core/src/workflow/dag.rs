use crate::error::DefinitionError;
use crate::types::{TaskId, TaskSpec, TaskState, TaskStatus, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Validated DAG of a workflow definition
///
/// Built once per definition and shared read-only by every instance of it.
#[derive(Debug)]
pub struct WorkflowDag {
    definition: WorkflowDefinition,
    graph: DiGraph<TaskId, ()>,
    task_indices: HashMap<TaskId, NodeIndex>,
    topo_order: Vec<TaskId>,
    reverse_order: Vec<TaskId>,
}

impl WorkflowDag {
    /// Build and validate the DAG of a workflow definition
    pub fn build(definition: WorkflowDefinition) -> Result<Self, DefinitionError> {
        if definition.tasks.is_empty() {
            return Err(DefinitionError::EmptyDefinition {
                name: definition.name.clone(),
                version: definition.version,
            });
        }

        let mut graph = DiGraph::new();
        let mut task_indices = HashMap::new();

        // Add all tasks as nodes; node index matches declaration position
        for task in &definition.tasks {
            if task_indices.contains_key(&task.id) {
                return Err(DefinitionError::DuplicateTaskId(task.id.clone()));
            }
            let node = graph.add_node(task.id.clone());
            task_indices.insert(task.id.clone(), node);
        }

        // Add dependency edges
        for task in &definition.tasks {
            let task_idx = task_indices[&task.id];

            for dep_id in &task.depends_on {
                let dep_idx =
                    task_indices
                        .get(dep_id)
                        .ok_or_else(|| DefinitionError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep_id.clone(),
                        })?;

                // Edge from dependency to dependent (dep -> task)
                graph.update_edge(*dep_idx, task_idx, ());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(DefinitionError::CyclicDependency { cycle });
        }

        let topo_order = depth_order(&graph);
        let reverse_order = topo_order.iter().rev().cloned().collect();

        Ok(Self {
            definition,
            graph,
            task_indices,
            topo_order,
            reverse_order,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.definition.tasks
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskSpec> {
        self.task_indices
            .get(task_id)
            .and_then(|node| self.definition.tasks.get(node.index()))
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.task_indices.contains_key(task_id)
    }

    /// Tasks ordered by depth (longest path from an entry task), ties broken
    /// by ascending task id
    pub fn topological_order(&self) -> &[TaskId] {
        &self.topo_order
    }

    /// Exact reverse of [`Self::topological_order`]; compensation walks this
    pub fn reverse_topological_order(&self) -> &[TaskId] {
        &self.reverse_order
    }

    /// Get dependencies for a task, in ascending id order
    pub fn dependencies(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Incoming)
    }

    /// Get tasks that depend on the given task, in ascending id order
    pub fn dependents(&self, task_id: &TaskId) -> Vec<TaskId> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    fn neighbors(&self, task_id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(node) = self.task_indices.get(task_id) else {
            return Vec::new();
        };

        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    /// Get all tasks with no dependencies (can start immediately)
    pub fn entry_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    /// Blocked tasks whose every dependency is Succeeded or Skipped
    pub fn ready_set(&self, states: &BTreeMap<TaskId, TaskState>) -> BTreeSet<TaskId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                let blocked = states
                    .get(&self.graph[n])
                    .is_some_and(|s| s.status == TaskStatus::Blocked);

                blocked
                    && self
                        .graph
                        .neighbors_directed(n, Direction::Incoming)
                        .all(|dep| {
                            states
                                .get(&self.graph[dep])
                                .is_some_and(|s| s.status.satisfies_dependents())
                        })
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

/// DFS over the dependency edges; a back edge closes a cycle
fn find_cycle(graph: &DiGraph<TaskId, ()>) -> Option<Vec<TaskId>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    let back_edge = depth_first_search(graph, graph.node_indices(), |event| match event {
        DfsEvent::TreeEdge(u, v) => {
            parent.insert(v, u);
            Control::Continue
        }
        DfsEvent::BackEdge(u, v) => Control::Break((u, v)),
        _ => Control::Continue,
    });

    let (from, to) = back_edge.break_value()?;

    let mut path = vec![from];
    let mut current = from;
    while current != to {
        current = *parent.get(&current)?;
        path.push(current);
    }
    path.reverse();
    path.push(to);

    Some(path.into_iter().map(|n| graph[n].clone()).collect())
}

/// Kahn's algorithm tracking the longest distance from an entry node.
/// Assumes the graph is acyclic.
fn depth_order(graph: &DiGraph<TaskId, ()>) -> Vec<TaskId> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut depth: HashMap<NodeIndex, usize> = graph.node_indices().map(|n| (n, 0)).collect();

    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n] == 0)
        .collect();

    while let Some(node) = queue.pop_front() {
        let next_depth = depth[&node] + 1;
        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(d) = depth.get_mut(&dependent) {
                *d = (*d).max(next_depth);
            }
            if let Some(remaining) = in_degree.get_mut(&dependent) {
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    let mut nodes: Vec<NodeIndex> = graph.node_indices().collect();
    nodes.sort_by(|a, b| depth[a].cmp(&depth[b]).then_with(|| graph[*a].cmp(&graph[*b])));
    nodes.into_iter().map(|n| graph[n].clone()).collect()
}
