//! The single sink collecting every file a run generates.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::RunError;
use crate::hash::Hash32;
use crate::task::TaskId;

/// A file produced by a task's build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    path: Utf8PathBuf,
    contents: String,
    task: TaskId,
}

impl GeneratedFile {
    pub fn new(path: impl Into<Utf8PathBuf>, contents: impl Into<String>, task: TaskId) -> Self {
        Self {
            path: normalize_path(&path.into()),
            contents: contents.into(),
            task,
        }
    }

    /// Path relative to the output root, with `.` and `..` folded away.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// The task that wrote this file.
    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn hash(&self) -> Hash32 {
        Hash32::hash(&self.contents)
    }
}

/// Every file written during a run, keyed by normalised path.
///
/// Each path has exactly one owner. A second write to a path is reported as
/// [`RunError::DuplicateFile`] instead of silently replacing the first.
#[derive(Debug, Clone, Default)]
pub struct GeneratorOutput {
    files: BTreeMap<Utf8PathBuf, GeneratedFile>,
}

impl GeneratorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: GeneratedFile) -> Result<(), RunError> {
        match self.files.entry(file.path.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(file);
                Ok(())
            }
            Entry::Occupied(slot) => Err(RunError::DuplicateFile {
                path: file.path,
                first: slot.get().task.clone(),
                second: file.task,
            }),
        }
    }

    pub fn extend(&mut self, files: impl IntoIterator<Item = GeneratedFile>) -> Result<(), RunError> {
        for file in files {
            self.insert(file)?;
        }
        Ok(())
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&GeneratedFile> {
        self.files.get(&normalize_path(path.as_ref()))
    }

    /// Files in path order.
    pub fn files(&self) -> impl Iterator<Item = &GeneratedFile> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// Leading `..` components that can not be folded are kept, which lets callers
/// detect paths escaping the output root.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => {}
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Whether a normalised path stays below the directory it is joined onto.
pub(crate) fn is_contained(path: &Utf8Path) -> bool {
    !path.as_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, task: &str) -> GeneratedFile {
        GeneratedFile::new(path, "contents\n", TaskId::new(task))
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path(Utf8Path::new("a/./b/../c")), Utf8Path::new("a/c"));
        assert_eq!(normalize_path(Utf8Path::new("../a")), Utf8Path::new("../a"));
        assert_eq!(normalize_path(Utf8Path::new("/a/../../b")), Utf8Path::new("/b"));
    }

    #[test]
    fn containment() {
        assert!(is_contained(Utf8Path::new("src/lib.rs")));
        assert!(!is_contained(Utf8Path::new("../lib.rs")));
        assert!(!is_contained(Utf8Path::new("/etc/passwd")));
        assert!(!is_contained(Utf8Path::new("")));
    }

    #[test]
    fn rejects_duplicate_paths_after_normalization() {
        let mut output = GeneratorOutput::new();
        output.insert(file("src/index.ts", "app#a")).unwrap();

        let err = output.insert(file("src/./index.ts", "app#b")).unwrap_err();
        match err {
            RunError::DuplicateFile { path, first, second } => {
                assert_eq!(path, "src/index.ts");
                assert_eq!(first.as_str(), "app#a");
                assert_eq!(second.as_str(), "app#b");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn files_are_path_ordered() {
        let mut output = GeneratorOutput::new();
        output
            .extend([file("b.txt", "app#a"), file("a.txt", "app#a")])
            .unwrap();

        let paths: Vec<_> = output.files().map(|f| f.path().as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
        assert!(output.get("./a.txt").is_some());
    }
}
