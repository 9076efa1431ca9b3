//! Coarse ordering groups for generator tasks.
//!
//! A [`TaskPhase`] bundles many tasks that must all run before or after
//! another group, even when no provider connects them. Phases are few, so the
//! phase graph is sorted once up front and every phase then gets its own step
//! schedule.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::graph::DiGraph;

use crate::error::{ConfigError, GraphError, ScheduleError};
use crate::graph::toposort_stable;

/// A named phase.
///
/// * `consumes_output_from(a)` on phase `b` means `a` runs before `b`.
/// * `adds_dynamic_tasks_to(a)` on phase `b` means `b` runs before `a`, so that
///   `b` can add tasks to `a` before it starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskPhase {
    name: Arc<str>,
    consumes_output_from: Vec<Arc<str>>,
    adds_dynamic_tasks_to: Vec<Arc<str>>,
}

impl TaskPhase {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            consumes_output_from: Vec::new(),
            adds_dynamic_tasks_to: Vec::new(),
        }
    }

    pub fn consumes_output_from(mut self, phase: &TaskPhase) -> Self {
        self.consumes_output_from.push(phase.name.clone());
        self
    }

    pub fn adds_dynamic_tasks_to(mut self, phase: &TaskPhase) -> Self {
        self.adds_dynamic_tasks_to.push(phase.name.clone());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Orders phases so that every phase comes after the phases it consumes from
/// and before the phases it adds tasks to.
///
/// Phases with no constraint between them keep their input order.
pub fn sort_task_phases(phases: &[TaskPhase]) -> Result<Vec<TaskPhase>, ScheduleError> {
    let mut graph = DiGraph::<&TaskPhase, ()>::with_capacity(phases.len(), 0);
    let mut by_name = HashMap::with_capacity(phases.len());

    for phase in phases {
        let index = graph.add_node(phase);
        if by_name.insert(phase.name(), index).is_some() {
            return Err(ConfigError::DuplicatePhase(phase.name().to_string()).into());
        }
    }

    let lookup = |name: &Arc<str>| {
        by_name
            .get(name.as_ref())
            .copied()
            .ok_or_else(|| ConfigError::UnknownPhase(name.to_string()))
    };

    for phase in phases {
        let this = by_name[phase.name()];

        for source in &phase.consumes_output_from {
            graph.update_edge(lookup(source)?, this, ());
        }

        for target in &phase.adds_dynamic_tasks_to {
            graph.update_edge(this, lookup(target)?, ());
        }
    }

    match toposort_stable(&graph) {
        Ok(order) => Ok(order.into_iter().map(|index| graph[index].clone()).collect()),
        Err(cycle) => Err(GraphError::PhaseCycle(
            cycle
                .into_iter()
                .map(|index| graph[index].name().to_string())
                .collect(),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(phases: &[TaskPhase]) -> Vec<&str> {
        phases.iter().map(TaskPhase::name).collect()
    }

    #[test]
    fn keeps_input_order_without_constraints() {
        let phases = [TaskPhase::new("b"), TaskPhase::new("a"), TaskPhase::new("c")];
        let sorted = sort_task_phases(&phases).unwrap();
        assert_eq!(names(&sorted), vec!["b", "a", "c"]);
    }

    #[test]
    fn consumes_output_from_orders_after() {
        let setup = TaskPhase::new("setup");
        let main = TaskPhase::new("main").consumes_output_from(&setup);

        let sorted = sort_task_phases(&[main, setup]).unwrap();
        assert_eq!(names(&sorted), vec!["setup", "main"]);
    }

    #[test]
    fn adds_dynamic_tasks_to_orders_before() {
        let main = TaskPhase::new("main");
        let plugins = TaskPhase::new("plugins").adds_dynamic_tasks_to(&main);

        let sorted = sort_task_phases(&[main, plugins]).unwrap();
        assert_eq!(names(&sorted), vec!["plugins", "main"]);
    }

    #[test]
    fn duplicate_phase_name() {
        let err = sort_task_phases(&[TaskPhase::new("A"), TaskPhase::new("A")]).unwrap_err();
        let message = err.to_string();

        assert_eq!(err, ConfigError::DuplicatePhase("A".into()).into());
        assert!(message.contains("duplicate"));
        assert!(message.contains('A'));
    }

    #[test]
    fn unknown_phase_reference() {
        let ghost = TaskPhase::new("ghost");
        let main = TaskPhase::new("main").consumes_output_from(&ghost);

        let err = sort_task_phases(&[main]).unwrap_err();
        assert_eq!(err, ConfigError::UnknownPhase("ghost".into()).into());
    }

    #[test]
    fn cycle_names_both_phases() {
        let a = TaskPhase::new("A");
        let b = TaskPhase::new("B");
        let a = a.consumes_output_from(&b);
        let b = b.consumes_output_from(&a);

        let err = sort_task_phases(&[a, b]).unwrap_err();
        let ScheduleError::Graph(GraphError::PhaseCycle(cycle)) = &err else {
            panic!("expected a phase cycle, got {err}");
        };

        assert!(cycle.contains(&"A".to_string()));
        assert!(cycle.contains(&"B".to_string()));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn sorting_is_deterministic() {
        let setup = TaskPhase::new("setup");
        let main = TaskPhase::new("main").consumes_output_from(&setup);
        let extra = TaskPhase::new("extra").adds_dynamic_tasks_to(&main);
        let phases = [main, extra, setup, TaskPhase::new("late")];

        let first = sort_task_phases(&phases).unwrap();
        let second = sort_task_phases(&phases).unwrap();
        assert_eq!(first, second);
    }
}
