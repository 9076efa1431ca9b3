#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
mod executor;
mod graph;
mod hash;
#[cfg(feature = "logging")]
mod logging;
pub mod merge;
mod output;
mod phase;
mod provider;
mod resolve;
mod schedule;
mod sync;
mod task;

use camino::Utf8Path;

pub use crate::config::SyncConfig;
pub use crate::error::*;
pub use crate::executor::{Diagnostics, GeneratorRun, StepExecution, execute};
pub use crate::hash::Hash32;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::merge::{MergeOptions, MergeResult, Merger, merge_text};
pub use crate::output::{GeneratedFile, GeneratorOutput};
pub use crate::phase::{TaskPhase, sort_task_phases};
pub use crate::provider::{
    Accumulator, Appender, Provider, ProviderDependency, ProviderExport, ProviderExportScope,
    ProviderId, ProviderKind, ProviderType,
};
pub use crate::schedule::{
    GraphMetadata, Plan, ProviderRelationship, Schedule, StepId, StepKind, TaskEntryMetadata,
};
pub use crate::sync::{FileReport, FileStatus, SyncReport, sync_output, sync_output_with};
pub use crate::task::{
    BuildContext, GeneratorBundle, GeneratorTask, InitContext, TaskDef, TaskEntry, TaskId,
    TaskInit,
};

/// Plans and runs every task of `bundle`, collecting the generated files.
///
/// All configuration and graph errors are reported before any task runs.
pub fn generate(
    bundle: &GeneratorBundle,
    phases: &[TaskPhase],
    config: &SyncConfig,
) -> Result<GeneratorRun, GensyncError> {
    let plan = Plan::new(bundle, phases)?;
    tracing::debug!(steps = plan.len(), "planned generator run");

    Ok(execute(&plan, config.jobs)?)
}

/// Runs `bundle` and syncs the generated files into `root`.
///
/// Nothing is written when a task fails, or when a merge leaves conflicts and
/// `config.force` is not set.
pub fn sync(
    bundle: &GeneratorBundle,
    phases: &[TaskPhase],
    root: impl AsRef<Utf8Path>,
    config: &SyncConfig,
) -> Result<SyncReport, GensyncError> {
    let run = generate(bundle, phases, config)?;
    Ok(sync_output(&run.output, root, config)?)
}
