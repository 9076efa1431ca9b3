use camino::Utf8PathBuf;
use thiserror::Error;

use crate::provider::ProviderKind;
use crate::schedule::StepId;
use crate::task::TaskId;

/// Problems with the declared task tree, detected before any step runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate phase name '{0}'")]
    DuplicatePhase(String),

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("task '{task}' depends on provider '{provider}' but no task in scope exports it")]
    MissingProvider { task: TaskId, provider: String },

    #[error("provider '{provider}' is exported to generator '{generator}' by both '{first}' and '{second}'")]
    AmbiguousProvider {
        provider: String,
        generator: String,
        first: TaskId,
        second: TaskId,
    },

    #[error("task '{task}' expects provider '{provider}' as {expected}, but '{producer}' provides it as {found}")]
    ProviderKindMismatch {
        task: TaskId,
        provider: String,
        producer: TaskId,
        expected: ProviderKind,
        found: ProviderKind,
    },

    #[error("task '{task}' exports provider '{provider}' to scope '{scope}', which no enclosing generator opens")]
    UnknownScope {
        task: TaskId,
        provider: String,
        scope: String,
    },

    #[error("task '{task}' depends on provider '{provider}' which it exports itself")]
    SelfDependency { task: TaskId, provider: String },

    #[error("task '{task}' in phase {phase} depends on '{producer}' which runs in later phase {producer_phase}")]
    PhaseOrder {
        task: TaskId,
        phase: String,
        producer: TaskId,
        producer_phase: String,
    },
}

/// A cycle found while ordering phases or steps. The cycle lists node ids in
/// edge order, with the first node repeated at the end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected between phases: {}", .0.join(" -> "))]
    PhaseCycle(Vec<String>),

    #[error("cycle detected between steps: {}", .0.join(" -> "))]
    StepCycle(Vec<String>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("step '{step}' failed:\n{source}")]
    Step {
        step: StepId,
        #[source]
        source: anyhow::Error,
    },

    #[error("step '{step}' panicked: {message}")]
    Panicked { step: StepId, message: String },

    #[error("task '{task}' did not provide a value for exported provider '{provider}'")]
    MissingExport { task: TaskId, provider: String },

    #[error("task '{task}' did not set its output provider '{provider}'")]
    MissingOutput { task: TaskId, provider: String },

    #[error("task '{task}' provided '{provider}' which it does not declare")]
    UndeclaredProvider { task: TaskId, provider: String },

    #[error("file '{path}' written by both '{first}' and '{second}'")]
    DuplicateFile {
        path: Utf8PathBuf,
        first: TaskId,
        second: TaskId,
    },

    #[error("failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("formatter failed:\n{0}")]
    Format(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error at '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("merge of '{path}' failed:\n{source}")]
    Merge {
        path: Utf8PathBuf,
        #[source]
        source: MergeError,
    },

    #[error("{} file(s) have unresolved conflicts: {}", .0.len(), join_paths(.0))]
    Conflicts(Vec<Utf8PathBuf>),

    #[error("path '{0}' escapes the output root")]
    InvalidPath(Utf8PathBuf),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| SyncError::Io { path, source }
    }
}

fn join_paths(paths: &[Utf8PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("couldn't read config file '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't parse config:\n{0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum GensyncError {
    #[error("Error while scheduling generator tasks.\n{0}")]
    Schedule(#[from] ScheduleError),

    #[error("Error while running generator tasks.\n{0}")]
    Run(#[from] RunError),

    #[error("Error while syncing generated files.\n{0}")]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigLoadError),
}

impl From<ConfigError> for GensyncError {
    fn from(err: ConfigError) -> Self {
        GensyncError::Schedule(err.into())
    }
}

impl From<GraphError> for GensyncError {
    fn from(err: GraphError) -> Self {
        GensyncError::Schedule(err.into())
    }
}
