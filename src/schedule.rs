//! Step graph construction and scheduling.
//!
//! Every task contributes two steps, `init|<id>` and `build|<id>`, joined by an
//! `init -> build` edge. Each resolved dependency of a consumer `C` on a
//! producer `P` in the same phase then adds:
//!
//! * for an output dependency: `build|P -> init|C`, because the value only
//!   exists once `P` has built;
//! * for an export dependency: `init|P -> init|C`, and unless the dependency
//!   is read-only also `build|C -> build|P`. Exports are typically collectors
//!   that consumers keep appending to, and `P` commits the collected state in
//!   its own build, so every writer has to be done by then.
//!
//! Producers in an earlier phase have already run, so they add no edge. The
//! resulting graph is sorted with a stable topological sort, which makes the
//! schedule a pure function of the task tree.

use std::collections::HashMap;
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Serialize, Serializer};

use crate::error::{ConfigError, GraphError, ScheduleError};
use crate::graph::toposort_stable;
use crate::phase::{TaskPhase, sort_task_phases};
use crate::resolve::{ResolvedDependency, resolve_dependencies};
use crate::task::{FlatTree, GeneratorBundle, TaskEntry, TaskId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Init,
    Build,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Init => f.write_str("init"),
            StepKind::Build => f.write_str("build"),
        }
    }
}

/// Identifier of a scheduled step, rendered as `init|<task id>` or
/// `build|<task id>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StepId {
    kind: StepKind,
    task: TaskId,
}

impl StepId {
    pub fn init(task: TaskId) -> Self {
        Self {
            kind: StepKind::Init,
            task,
        }
    }

    pub fn build(task: TaskId) -> Self {
        Self {
            kind: StepKind::Build,
            task,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn task(&self) -> &TaskId {
        &self.task
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.kind, self.task)
    }
}

impl Serialize for StepId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A step as an index into the plan's task entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Step {
    pub task: usize,
    pub kind: StepKind,
}

/// The ordered steps of one phase.
#[derive(Debug, Clone)]
pub struct Schedule {
    phase: Option<TaskPhase>,
    steps: Vec<StepId>,
    edges: Vec<(StepId, StepId)>,
    pub(crate) order: Vec<Step>,
    /// Predecessors of every step in `order`, by position in `order`.
    pub(crate) predecessors: Vec<Vec<usize>>,
}

impl Schedule {
    /// The phase this schedule belongs to, `None` for tasks without a phase.
    pub fn phase(&self) -> Option<&TaskPhase> {
        self.phase.as_ref()
    }

    pub fn steps(&self) -> &[StepId] {
        &self.steps
    }

    /// Every ordering constraint the schedule satisfies.
    pub fn edges(&self) -> &[(StepId, StepId)] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Task tree metadata for visualisation tools.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    pub task_entries: Vec<TaskEntryMetadata>,
    pub provider_relationships: Vec<ProviderRelationship>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntryMetadata {
    pub id: TaskId,
    pub generator_name: String,
    pub task_name: String,
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRelationship {
    pub producer_id: TaskId,
    pub consumer_id: TaskId,
    pub provider_name: String,
    pub is_output: bool,
    pub is_read_only: bool,
}

impl GraphMetadata {
    fn new(entries: &[TaskEntry], resolved: &[Vec<ResolvedDependency>]) -> Self {
        let task_entries = entries
            .iter()
            .map(|entry| TaskEntryMetadata {
                id: entry.id.clone(),
                generator_name: entry.generator_name.clone(),
                task_name: entry.task_name.clone(),
                phase: entry.phase.as_deref().map(str::to_string),
            })
            .collect();

        let provider_relationships = entries
            .iter()
            .zip(resolved)
            .flat_map(|(consumer, dependencies)| {
                dependencies.iter().filter_map(move |resolved| {
                    let producer = resolved.producer?;
                    Some(ProviderRelationship {
                        producer_id: entries[producer].id.clone(),
                        consumer_id: consumer.id.clone(),
                        provider_name: resolved.dependency.provider().name().to_string(),
                        is_output: resolved.dependency.is_output(),
                        is_read_only: resolved.dependency.is_read_only(),
                    })
                })
            })
            .collect();

        Self {
            task_entries,
            provider_relationships,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Renders the task graph as a mermaid flowchart. Output dependencies are
/// drawn dotted, read-only dependencies are marked.
impl fmt::Display for GraphMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let mut index = HashMap::with_capacity(self.task_entries.len());
        for (i, task) in self.task_entries.iter().enumerate() {
            index.insert(&task.id, i);
            let name = task.id.as_str().replace('"', "\\\"");
            writeln!(f, "    {i}[\"{name}\"]")?;
        }

        for relation in &self.provider_relationships {
            let (Some(source), Some(target)) =
                (index.get(&relation.producer_id), index.get(&relation.consumer_id))
            else {
                continue;
            };

            let mut label = relation
                .provider_name
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('"', "\\\"");
            if relation.is_read_only {
                label.push_str(" (read-only)");
            }

            if relation.is_output {
                writeln!(f, "    {source} -. \"{label}\" .-> {target}")?;
            } else {
                writeln!(f, "    {source} -- \"{label}\" --> {target}")?;
            }
        }

        Ok(())
    }
}

/// A complete execution plan: every phase's schedule, in phase order.
pub struct Plan {
    pub(crate) entries: Vec<TaskEntry>,
    pub(crate) resolved: Vec<Vec<ResolvedDependency>>,
    schedules: Vec<Schedule>,
    metadata: GraphMetadata,
}

impl Plan {
    /// Flattens `bundle`, resolves providers, orders `phases` and schedules
    /// every phase. All configuration and graph errors surface here, before
    /// any task runs.
    pub fn new(bundle: &GeneratorBundle, phases: &[TaskPhase]) -> Result<Self, ScheduleError> {
        let tree = FlatTree::flatten(bundle)?;
        let resolved = resolve_dependencies(&tree)?;
        let phases = sort_task_phases(phases)?;
        let entries = tree.entries;

        let batch_of = assign_batches(&entries, &phases)?;
        check_phase_order(&entries, &resolved, &batch_of, &phases)?;

        let mut schedules = Vec::new();
        for batch in 0..=phases.len() {
            let tasks: Vec<usize> = (0..entries.len()).filter(|&t| batch_of[t] == batch).collect();
            if tasks.is_empty() {
                continue;
            }

            let phase = batch.checked_sub(1).map(|i| phases[i].clone());
            let schedule = schedule_batch(&entries, &resolved, &batch_of, batch, &tasks, phase)?;
            tracing::debug!(
                phase = schedule.phase().map(TaskPhase::name).unwrap_or("<none>"),
                steps = schedule.len(),
                "scheduled phase"
            );
            schedules.push(schedule);
        }

        let metadata = GraphMetadata::new(&entries, &resolved);

        Ok(Self {
            entries,
            resolved,
            schedules,
            metadata,
        })
    }

    /// Per-phase schedules, in execution order.
    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// Every step of the run, in execution order.
    pub fn steps(&self) -> Vec<&StepId> {
        self.schedules.iter().flat_map(|s| s.steps.iter()).collect()
    }

    pub fn metadata(&self) -> &GraphMetadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.schedules.iter().map(Schedule::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("schedules", &self.schedules)
            .finish_non_exhaustive()
    }
}

/// Batch 0 holds tasks without a phase, batch `i + 1` holds phase `i`.
fn assign_batches(entries: &[TaskEntry], phases: &[TaskPhase]) -> Result<Vec<usize>, ConfigError> {
    let position: HashMap<&str, usize> = phases
        .iter()
        .enumerate()
        .map(|(i, phase)| (phase.name(), i + 1))
        .collect();

    entries
        .iter()
        .map(|entry| match entry.phase.as_deref() {
            None => Ok(0),
            Some(name) => position
                .get(name)
                .copied()
                .ok_or_else(|| ConfigError::UnknownPhase(name.to_string())),
        })
        .collect()
}

fn check_phase_order(
    entries: &[TaskEntry],
    resolved: &[Vec<ResolvedDependency>],
    batch_of: &[usize],
    phases: &[TaskPhase],
) -> Result<(), ConfigError> {
    let label = |batch: usize| match batch.checked_sub(1) {
        Some(i) => format!("'{}'", phases[i].name()),
        None => "<none>".to_string(),
    };

    for (consumer, dependencies) in resolved.iter().enumerate() {
        for producer in dependencies.iter().filter_map(|d| d.producer) {
            if batch_of[producer] > batch_of[consumer] {
                return Err(ConfigError::PhaseOrder {
                    task: entries[consumer].id.clone(),
                    phase: label(batch_of[consumer]),
                    producer: entries[producer].id.clone(),
                    producer_phase: label(batch_of[producer]),
                });
            }
        }
    }

    Ok(())
}

fn schedule_batch(
    entries: &[TaskEntry],
    resolved: &[Vec<ResolvedDependency>],
    batch_of: &[usize],
    batch: usize,
    tasks: &[usize],
    phase: Option<TaskPhase>,
) -> Result<Schedule, GraphError> {
    let mut graph = DiGraph::<Step, ()>::with_capacity(tasks.len() * 2, tasks.len() * 3);
    let mut nodes: HashMap<usize, (NodeIndex, NodeIndex)> = HashMap::with_capacity(tasks.len());

    for &task in tasks {
        let init = graph.add_node(Step {
            task,
            kind: StepKind::Init,
        });
        let build = graph.add_node(Step {
            task,
            kind: StepKind::Build,
        });
        graph.add_edge(init, build, ());
        nodes.insert(task, (init, build));
    }

    for &consumer in tasks {
        let (consumer_init, consumer_build) = nodes[&consumer];

        for dependency in &resolved[consumer] {
            let Some(producer) = dependency.producer else {
                continue;
            };
            if batch_of[producer] != batch {
                continue;
            }

            let (producer_init, producer_build) = nodes[&producer];

            if dependency.dependency.is_output() {
                graph.update_edge(producer_build, consumer_init, ());
            } else {
                graph.update_edge(producer_init, consumer_init, ());
                if !dependency.dependency.is_read_only() {
                    graph.update_edge(consumer_build, producer_build, ());
                }
            }
        }
    }

    let step_id = |step: Step| match step.kind {
        StepKind::Init => StepId::init(entries[step.task].id.clone()),
        StepKind::Build => StepId::build(entries[step.task].id.clone()),
    };

    let sorted = toposort_stable(&graph).map_err(|cycle| {
        GraphError::StepCycle(cycle.into_iter().map(|i| step_id(graph[i]).to_string()).collect())
    })?;

    let mut position = vec![0; graph.node_count()];
    for (at, node) in sorted.iter().enumerate() {
        position[node.index()] = at;
    }

    let mut predecessors = vec![Vec::new(); sorted.len()];
    let mut edges = Vec::with_capacity(graph.edge_count());
    for edge in graph.raw_edges() {
        predecessors[position[edge.target().index()]].push(position[edge.source().index()]);
        edges.push((step_id(graph[edge.source()]), step_id(graph[edge.target()])));
    }

    let order: Vec<Step> = sorted.iter().map(|&i| graph[i]).collect();
    let steps = order.iter().map(|&step| step_id(step)).collect();

    Ok(Schedule {
        phase,
        steps,
        edges,
        order,
        predecessors,
    })
}
