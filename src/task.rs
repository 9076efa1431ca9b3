//! Generator bundles and the tasks they declare.
//!
//! Callers describe *what* to generate as a tree of [`GeneratorBundle`]s. Each
//! bundle owns a handful of [`GeneratorTask`]s and any number of named child
//! bundles. At the start of a run the tree is flattened into [`TaskEntry`]s,
//! which are immutable for the rest of the run.
//!
//! A task runs in two steps:
//!
//! 1. **init** calls the task's `run` closure with its resolved dependencies.
//!    The closure returns the values of the providers the task exports and,
//!    optionally, a build closure.
//! 2. **build** calls that build closure with a [`BuildContext`], through which
//!    the task writes files and sets its output provider.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::ConfigError;
use crate::output::GeneratedFile;
use crate::phase::TaskPhase;
use crate::provider::{
    Dynamic, Provider, ProviderDependency, ProviderExport, ProviderExportScope, ProviderId,
    ProviderType,
};

/// Unique id of a task within one run: `<generator path>#<task name>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type RunFn = Arc<dyn Fn(&InitContext<'_>) -> anyhow::Result<TaskInit> + Send + Sync>;

pub(crate) type BuildFn = Box<dyn FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send>;

/// A node of the declarative generator tree.
pub struct GeneratorBundle {
    name: Cow<'static, str>,
    scopes: Vec<ProviderExportScope>,
    tasks: Vec<GeneratorTask>,
    children: Vec<(Cow<'static, str>, GeneratorBundle)>,
}

impl GeneratorBundle {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            scopes: Vec::new(),
            tasks: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Opens `scope` at this generator: scoped exports from anywhere in this
    /// subtree become visible to the whole subtree.
    pub fn scope(mut self, scope: &ProviderExportScope) -> Self {
        self.scopes.push(scope.clone());
        self
    }

    pub fn task(mut self, task: GeneratorTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn child(mut self, key: impl Into<Cow<'static, str>>, bundle: GeneratorBundle) -> Self {
        self.children.push((key.into(), bundle));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for GeneratorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorBundle")
            .field("name", &self.name)
            .field("scopes", &self.scopes)
            .field("tasks", &self.tasks)
            .field("children", &self.children)
            .finish()
    }
}

/// Declaration of a task, before its `run` closure is attached.
pub struct TaskDef {
    name: Cow<'static, str>,
    phase: Option<Arc<str>>,
    dependencies: BTreeMap<String, ProviderDependency>,
    exports: BTreeMap<String, ProviderExport>,
    output: Option<ProviderExport>,
}

impl TaskDef {
    pub fn phase(mut self, phase: &TaskPhase) -> Self {
        self.phase = Some(phase.name_arc().clone());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>, dependency: ProviderDependency) -> Self {
        self.dependencies.insert(key.into(), dependency);
        self
    }

    pub fn exports(mut self, key: impl Into<String>, export: ProviderExport) -> Self {
        self.exports.insert(key.into(), export);
        self
    }

    /// Declares the provider this task produces in its build step.
    pub fn output(mut self, export: ProviderExport) -> Self {
        self.output = Some(export);
        self
    }

    pub fn run<F>(self, callback: F) -> GeneratorTask
    where
        F: Fn(&InitContext<'_>) -> anyhow::Result<TaskInit> + Send + Sync + 'static,
    {
        GeneratorTask {
            def: self,
            run: Arc::new(callback),
        }
    }
}

/// A task ready to be placed in a [`GeneratorBundle`].
pub struct GeneratorTask {
    def: TaskDef,
    run: RunFn,
}

impl GeneratorTask {
    pub fn named(name: impl Into<Cow<'static, str>>) -> TaskDef {
        TaskDef {
            name: name.into(),
            phase: None,
            dependencies: BTreeMap::new(),
            exports: BTreeMap::new(),
            output: None,
        }
    }
}

impl fmt::Debug for GeneratorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeneratorTask({})", self.def.name)
    }
}

/// A generator node after flattening.
#[derive(Debug)]
pub(crate) struct GeneratorNode {
    pub id: String,
    pub parent: Option<usize>,
    pub scopes: Vec<ProviderExportScope>,
}

/// One task of the flattened tree.
#[derive(Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub generator_name: String,
    pub task_name: String,
    pub phase: Option<Arc<str>>,
    pub dependencies: BTreeMap<String, ProviderDependency>,
    pub exports: BTreeMap<String, ProviderExport>,
    pub output: Option<ProviderExport>,
    pub(crate) generator: usize,
    pub(crate) run: RunFn,
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("dependencies", &self.dependencies)
            .field("exports", &self.exports)
            .field("output", &self.output)
            .finish()
    }
}

/// The flattened generator tree. Generators are stored in pre-order, so every
/// parent comes before its children.
#[derive(Debug)]
pub(crate) struct FlatTree {
    pub generators: Vec<GeneratorNode>,
    pub entries: Vec<TaskEntry>,
}

impl FlatTree {
    pub fn flatten(root: &GeneratorBundle) -> Result<Self, ConfigError> {
        let mut tree = FlatTree {
            generators: Vec::new(),
            entries: Vec::new(),
        };
        let mut seen = HashSet::new();
        let mut stack = vec![(root, root.name.to_string(), None)];

        while let Some((bundle, id, parent)) = stack.pop() {
            let index = tree.generators.len();
            tree.generators.push(GeneratorNode {
                id: id.clone(),
                parent,
                scopes: bundle.scopes.clone(),
            });

            for task in &bundle.tasks {
                let task_id = TaskId::new(format!("{id}#{}", task.def.name));
                if !seen.insert(task_id.clone()) {
                    return Err(ConfigError::DuplicateTask(task_id));
                }

                tree.entries.push(TaskEntry {
                    id: task_id,
                    generator_name: bundle.name.to_string(),
                    task_name: task.def.name.to_string(),
                    phase: task.def.phase.clone(),
                    dependencies: task.def.dependencies.clone(),
                    exports: task.def.exports.clone(),
                    output: task.def.output.clone(),
                    generator: index,
                    run: task.run.clone(),
                });
            }

            // reversed so that the first child is visited first
            for (key, child) in bundle.children.iter().rev() {
                stack.push((child, format!("{id}.{key}"), Some(index)));
            }
        }

        Ok(tree)
    }
}

/// Resolved dependency values handed to a task's `run` closure.
pub struct InitContext<'a> {
    pub(crate) task: &'a TaskId,
    pub(crate) values: Vec<(&'a str, ProviderId, Option<Dynamic>)>,
}

impl<'a> InitContext<'a> {
    pub fn task_id(&self) -> &TaskId {
        self.task
    }

    /// Returns the value of a required dependency.
    pub fn get<T>(&self, provider: &Provider<T>) -> anyhow::Result<&T>
    where
        T: Send + Sync + 'static,
    {
        self.get_optional(provider)?.with_context(|| {
            format!(
                "provider '{}' was not resolved for task '{}'",
                provider.name(),
                self.task
            )
        })
    }

    /// Returns the value of a dependency, or `None` if it is optional and no
    /// exporter was found.
    pub fn get_optional<T>(&self, provider: &Provider<T>) -> anyhow::Result<Option<&T>>
    where
        T: Send + Sync + 'static,
    {
        let (_, _, value) = self
            .values
            .iter()
            .find(|(_, id, _)| *id == provider.id())
            .ok_or_else(|| {
                anyhow!(
                    "task '{}' does not declare a dependency on '{}'",
                    self.task,
                    provider.name()
                )
            })?;

        match value {
            Some(value) => value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or_else(|| anyhow!("provider '{}' holds a value of another type", provider.name())),
            None => Ok(None),
        }
    }

    /// Looks a dependency up by the key it was declared under.
    pub fn get_key<T>(&self, key: &str) -> anyhow::Result<Option<&T>>
    where
        T: Send + Sync + 'static,
    {
        let (_, _, value) = self
            .values
            .iter()
            .find(|(name, _, _)| *name == key)
            .ok_or_else(|| anyhow!("task '{}' has no dependency '{key}'", self.task))?;

        match value {
            Some(value) => value
                .downcast_ref::<T>()
                .map(Some)
                .ok_or_else(|| anyhow!("dependency '{key}' holds a value of another type")),
            None => Ok(None),
        }
    }
}

/// What a task's `run` closure returns.
#[derive(Default)]
pub struct TaskInit {
    pub(crate) providers: Vec<(ProviderType, Dynamic)>,
    pub(crate) build: Option<BuildFn>,
}

impl TaskInit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies the value of an exported provider.
    pub fn provide<T>(mut self, provider: &Provider<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.providers.push((provider.ty().clone(), Arc::new(value)));
        self
    }

    pub fn build<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.build = Some(Box::new(callback));
        self
    }
}

/// Handed to a task's build closure.
pub struct BuildContext<'a> {
    pub(crate) task: &'a TaskId,
    pub(crate) output_provider: Option<ProviderId>,
    pub(crate) files: Vec<GeneratedFile>,
    pub(crate) output: Option<Dynamic>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(task: &'a TaskId, output_provider: Option<ProviderId>) -> Self {
        Self {
            task,
            output_provider,
            files: Vec::new(),
            output: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        self.task
    }

    /// Queues a file for the run's output. The path is relative to the output
    /// root.
    pub fn write_file(&mut self, path: impl Into<Utf8PathBuf>, contents: impl Into<String>) {
        self.files
            .push(GeneratedFile::new(path, contents, self.task.clone()));
    }

    /// Sets the value of this task's output provider.
    pub fn set_output<T>(&mut self, provider: &Provider<T>, value: T) -> anyhow::Result<()>
    where
        T: Send + Sync + 'static,
    {
        if self.output_provider != Some(provider.id()) {
            anyhow::bail!(
                "task '{}' does not declare '{}' as its output",
                self.task,
                provider.name()
            );
        }

        self.output = Some(Arc::new(value));
        Ok(())
    }
}
