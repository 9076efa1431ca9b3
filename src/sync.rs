//! Writes a run's [`GeneratorOutput`] into a working tree.
//!
//! For every generated file the working copy, the previously generated
//! baseline and the new text are merged three ways. The baseline lives in a
//! mirror directory below the output root (`.gensync/generated` by default)
//! and is replaced with the new generated text after every sync, so the next
//! run can tell generator changes apart from user edits.
//!
//! A sync is planned in full before anything is written. If any merge leaves
//! conflicts and `force` is not set, nothing is written at all. Every write
//! goes to a temporary file first and is then renamed into place.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::hash::Hash32;
use crate::merge::Merger;
use crate::output::{GeneratorOutput, is_contained, normalize_path};

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_RED: Style = Style::new().red();
const ANSI_BLUE: Style = Style::new().blue();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// No working copy existed.
    Created,
    /// The working copy was replaced with the generated text.
    Updated,
    /// User edits and generator changes were merged cleanly.
    Merged,
    /// The merged text contains conflict markers.
    Conflicted,
    /// The working copy already had the right contents.
    Unchanged,
    /// No longer generated, and removed from the working tree.
    Removed,
    /// No longer generated, but kept because the user edited it.
    Kept,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileStatus::Created => "created",
            FileStatus::Updated => "updated",
            FileStatus::Merged => "merged",
            FileStatus::Conflicted => "conflicted",
            FileStatus::Unchanged => "unchanged",
            FileStatus::Removed => "removed",
            FileStatus::Kept => "kept",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: Utf8PathBuf,
    pub status: FileStatus,
    /// Fingerprint of the working copy after the sync, if the file exists.
    pub hash: Option<Hash32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub files: Vec<FileReport>,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|file| file.status == status).count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Utf8Path> {
        self.files
            .iter()
            .filter(|file| file.status == FileStatus::Conflicted)
            .map(|file| file.path.as_path())
    }

    pub fn has_conflicts(&self) -> bool {
        self.conflicts().next().is_some()
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&FileReport> {
        self.files.iter().find(|file| file.path == path.as_ref())
    }
}

/// One line summary, colored when the terminal supports it.
impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "Would sync" } else { "Synced" };
        write!(f, "{verb} {} files:", self.files.len())?;

        let parts = [
            (FileStatus::Created, ANSI_GREEN),
            (FileStatus::Updated, ANSI_GREEN),
            (FileStatus::Merged, ANSI_YELLOW),
            (FileStatus::Conflicted, ANSI_RED),
            (FileStatus::Removed, ANSI_YELLOW),
            (FileStatus::Kept, ANSI_YELLOW),
            (FileStatus::Unchanged, ANSI_BLUE),
        ];

        let mut first = true;
        for (status, style) in parts {
            let count = self.count(status);
            if count == 0 {
                continue;
            }
            let sep = if first { " " } else { ", " };
            first = false;
            write!(f, "{sep}{}", style.apply_to(format!("{count} {status}")))?;
        }

        if first {
            write!(f, " nothing to do")?;
        }

        Ok(())
    }
}

/// A planned change to one file.
struct Pending {
    report: FileReport,
    /// New contents of the working copy.
    write: Option<String>,
    /// New contents of the baseline, `None` to leave it as is.
    baseline: Option<String>,
    remove_file: bool,
    remove_baseline: bool,
}

/// Syncs `output` into `root` with a [`Merger`] built from `config.merge`.
pub fn sync_output(
    output: &GeneratorOutput,
    root: impl AsRef<Utf8Path>,
    config: &SyncConfig,
) -> Result<SyncReport, SyncError> {
    sync_output_with(output, root, config, &Merger::new(config.merge.clone()))
}

/// Syncs `output` into `root` using `merger`, e.g. one with a formatter.
pub fn sync_output_with(
    output: &GeneratorOutput,
    root: impl AsRef<Utf8Path>,
    config: &SyncConfig,
    merger: &Merger,
) -> Result<SyncReport, SyncError> {
    let root = root.as_ref();
    let baseline_dir = normalize_path(&config.baseline_dir);
    if !is_contained(&baseline_dir) {
        return Err(SyncError::InvalidPath(config.baseline_dir.clone()));
    }
    let baseline_root = root.join(&baseline_dir);

    let mut pending = Vec::with_capacity(output.len());
    for file in output.files() {
        let path = file.path();
        if !is_contained(path) || path.starts_with(&baseline_dir) {
            return Err(SyncError::InvalidPath(path.to_owned()));
        }

        let user = read_optional(&root.join(path))?;
        let base = read_optional(&baseline_root.join(path))?;
        let generated = file.contents();

        let baseline = match &base {
            Some(base) if Hash32::hash(base) == file.hash() => None,
            _ => Some(generated.to_string()),
        };

        let current = user.as_deref().map(Hash32::hash);
        let (status, write) = match user {
            None => (FileStatus::Created, Some(generated.to_string())),
            Some(user) => match merger
                .merge(&user, generated, base.as_deref())
                .map_err(|source| SyncError::Merge {
                    path: path.to_owned(),
                    source,
                })? {
                None => (FileStatus::Unchanged, None),
                Some(result) if Some(Hash32::hash(&result.merged_text)) == current => {
                    (FileStatus::Unchanged, None)
                }
                Some(result) => {
                    let status = if result.has_conflict {
                        tracing::warn!(path = %path, "merge left conflicts");
                        FileStatus::Conflicted
                    } else if base.as_deref().is_none_or(|base| base == user) {
                        FileStatus::Updated
                    } else {
                        FileStatus::Merged
                    };
                    (status, Some(result.merged_text))
                }
            },
        };

        tracing::debug!(path = %path, %status, "planned file");

        let hash = write.as_deref().map(Hash32::hash).or(current);

        pending.push(Pending {
            report: FileReport {
                path: path.to_owned(),
                status,
                hash,
            },
            write,
            baseline,
            remove_file: false,
            remove_baseline: false,
        });
    }

    let generated: HashSet<&Utf8Path> = output.files().map(|file| file.path()).collect();
    for path in scan_baseline(&baseline_root)? {
        if generated.contains(path.as_path()) {
            continue;
        }
        pending.push(plan_orphan(root, &baseline_root, path)?);
    }

    let report = SyncReport {
        files: pending.iter().map(|p| p.report.clone()).collect(),
        dry_run: config.dry_run,
    };

    if config.dry_run {
        tracing::info!("{report}");
        return Ok(report);
    }

    if report.has_conflicts() && !config.force {
        return Err(SyncError::Conflicts(
            report.conflicts().map(Utf8Path::to_owned).collect(),
        ));
    }

    for change in pending {
        let path = &change.report.path;
        if let Some(text) = &change.write {
            write_atomic(&root.join(path), text)?;
        }
        if let Some(text) = &change.baseline {
            write_atomic(&baseline_root.join(path), text)?;
        }
        if change.remove_file {
            remove_file(&root.join(path))?;
        }
        if change.remove_baseline {
            remove_file(&baseline_root.join(path))?;
        }
    }

    tracing::info!("{report}");
    Ok(report)
}

/// A file that has a baseline but is no longer generated is removed, unless
/// the user changed it since it was last generated.
fn plan_orphan(root: &Utf8Path, baseline_root: &Utf8Path, path: Utf8PathBuf) -> Result<Pending, SyncError> {
    let base = read_optional(&baseline_root.join(&path))?;
    let user = read_optional(&root.join(&path))?;

    let (status, hash) = match (&user, &base) {
        (Some(user), Some(base)) if user != base => (FileStatus::Kept, Some(Hash32::hash(user))),
        _ => (FileStatus::Removed, None),
    };

    Ok(Pending {
        report: FileReport { path, status, hash },
        write: None,
        baseline: None,
        remove_file: status == FileStatus::Removed && user.is_some(),
        remove_baseline: true,
    })
}

/// Every file below `baseline_root`, relative to it, in path order.
fn scan_baseline(baseline_root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SyncError> {
    if !baseline_root.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = format!("{}/**/*", glob::Pattern::escape(baseline_root.as_str()));
    let entries = glob::glob(&pattern).map_err(|_| SyncError::InvalidPath(baseline_root.to_owned()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| SyncError::Io {
            path: Utf8PathBuf::from(err.path().to_string_lossy().into_owned()),
            source: err.into(),
        })?;

        let path = Utf8PathBuf::from_path_buf(entry)
            .map_err(|path| SyncError::InvalidPath(path.to_string_lossy().into_owned().into()))?;
        if !path.is_file() || is_temporary(&path) {
            continue;
        }

        if let Ok(relative) = path.strip_prefix(baseline_root) {
            paths.push(relative.to_owned());
        }
    }

    paths.sort();
    Ok(paths)
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, SyncError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SyncError::io(path)(err)),
    }
}

const TEMP_SUFFIX: &str = ".gensync-tmp";

fn is_temporary(path: &Utf8Path) -> bool {
    path.file_name().is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

/// Writes to a sibling temporary file, then renames it over `path`.
fn write_atomic(path: &Utf8Path, contents: &str) -> Result<(), SyncError> {
    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent).map_err(SyncError::io(parent))?;

    let name = path.file_name().unwrap_or("file");
    let temp = parent.join(format!(".{name}{TEMP_SUFFIX}"));

    fs::write(&temp, contents).map_err(SyncError::io(&temp))?;
    fs::rename(&temp, path).map_err(|source| {
        let _ = fs::remove_file(&temp);
        SyncError::Io {
            path: path.to_owned(),
            source,
        }
    })
}

fn remove_file(path: &Utf8Path) -> Result<(), SyncError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SyncError::io(path)(err)),
    }
}
