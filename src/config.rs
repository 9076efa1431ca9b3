//! Run configuration, loadable from JSON.
//!
//! ```json
//! {
//!   "jobs": 4,
//!   "force": false,
//!   "baseline_dir": ".gensync/generated",
//!   "merge": { "style": "diff3", "two_way": "overwrite" }
//! }
//! ```
//!
//! Every field is optional and falls back to its default.

use std::fs;
use std::num::NonZeroUsize;
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigLoadError;
use crate::merge::MergeOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Worker threads used to run independent steps. `1` runs every step on
    /// the calling thread in schedule order.
    pub jobs: usize,
    pub merge: MergeOptions,
    /// Write merged files even when some of them contain conflicts.
    pub force: bool,
    /// Where the previously generated text of every file is kept, relative to
    /// the output root.
    pub baseline_dir: Utf8PathBuf,
    /// Compute the sync report without touching the disk.
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            merge: MergeOptions::default(),
            force: false,
            baseline_dir: Utf8PathBuf::from(".gensync/generated"),
            dry_run: false,
        }
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

impl SyncConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn merge(mut self, merge: MergeOptions) -> Self {
        self.merge = merge;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn baseline_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.baseline_dir = dir.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
