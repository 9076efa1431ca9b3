//! Three-way text merge.
//!
//! Reconciles freshly generated text with the working copy a user may have
//! edited, using the previously generated text as the common base. Merging is
//! purely line based: lines keep their terminators, so a missing trailing
//! newline survives a clean merge untouched. A conflict region always ends
//! with a newline after its closing marker.
//!
//! Conflicts are never errors. They are embedded in the merged text between
//! `<<<<<<<`, `=======` and `>>>>>>>` markers and flagged in
//! [`MergeResult::has_conflict`]. Conflict markers the user added to the
//! working copy and left in place are flagged as well, while marker-like
//! lines coming from the generator are plain text.

mod diff;
mod diff3;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MergeError;

pub use diff3::{Chunk, diff3};

/// How conflict regions are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStyle {
    /// `<<<<<<<` user `=======` generated `>>>>>>>`
    #[default]
    Merge,
    /// Like `Merge`, with the base lines in a `|||||||` section.
    Diff3,
}

/// What to do when there is no base to merge against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoWayMode {
    /// Replace the working copy with the generated text.
    #[default]
    Overwrite,
    /// Diff the working copy against the generated text and mark every
    /// difference as a conflict.
    MarkConflicts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub style: ConflictStyle,
    pub two_way: TwoWayMode,
    pub user_label: String,
    pub base_label: String,
    pub generated_label: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            style: ConflictStyle::default(),
            two_way: TwoWayMode::default(),
            user_label: String::from("existing"),
            base_label: String::from("base"),
            generated_label: String::from("generated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub merged_text: String,
    pub has_conflict: bool,
}

impl MergeResult {
    fn clean(text: &str) -> Self {
        Self {
            merged_text: text.to_string(),
            has_conflict: false,
        }
    }
}

/// Merges `generated` into `user` using `base` as the common ancestor.
///
/// Returns `None` when the working copy already equals the generated text.
/// Without a base, or when the user never touched the file, the generated
/// text is taken as is (see [`TwoWayMode`] for the alternative).
pub fn merge_text(
    user: &str,
    generated: &str,
    base: Option<&str>,
    options: &MergeOptions,
) -> Option<MergeResult> {
    if user == generated {
        return None;
    }

    let user_lines: Vec<&str> = user.split_inclusive('\n').collect();
    let generated_lines: Vec<&str> = generated.split_inclusive('\n').collect();

    let result = match base {
        Some(base) if base == user => MergeResult::clean(generated),
        Some(base) => {
            let base_lines: Vec<&str> = base.split_inclusive('\n').collect();
            render(&diff3(&user_lines, &base_lines, &generated_lines), options)
        }
        None => match options.two_way {
            TwoWayMode::Overwrite => MergeResult::clean(generated),
            TwoWayMode::MarkConflicts => {
                render(&two_way_chunks(&user_lines, &generated_lines), options)
            }
        },
    };

    Some(result)
}

fn two_way_chunks<'a>(user: &'a [&'a str], generated: &'a [&'a str]) -> Vec<Chunk<'a>> {
    let mut chunks = Vec::new();
    let mut at = 0;

    for hunk in diff::diff(user, generated) {
        if at < hunk.old.start {
            chunks.push(Chunk::Stable(&user[at..hunk.old.start]));
        }
        chunks.push(Chunk::Conflict {
            user: &user[hunk.old.clone()],
            base: &[],
            generated: &generated[hunk.new.clone()],
        });
        at = hunk.old.end;
    }

    if at < user.len() {
        chunks.push(Chunk::Stable(&user[at..]));
    }

    chunks
}

/// Renders merge chunks into text.
pub fn render(chunks: &[Chunk<'_>], options: &MergeOptions) -> MergeResult {
    let mut merged = String::new();
    let mut has_conflict = false;

    for chunk in chunks {
        match chunk {
            Chunk::Stable(lines) | Chunk::Resolved(lines) => merged.extend(lines.iter().copied()),
            Chunk::Edited(lines) => {
                // markers the user left behind are still unresolved
                has_conflict |= lines.iter().any(|line| line.starts_with("<<<<<<<"));
                merged.extend(lines.iter().copied());
            }
            Chunk::Conflict {
                user,
                base,
                generated,
            } => {
                has_conflict = true;

                push_marker(&mut merged, "<<<<<<<", &options.user_label);
                push_section(&mut merged, user);
                if options.style == ConflictStyle::Diff3 {
                    push_marker(&mut merged, "|||||||", &options.base_label);
                    push_section(&mut merged, base);
                }
                merged.push_str("=======\n");
                push_section(&mut merged, generated);
                push_marker(&mut merged, ">>>>>>>", &options.generated_label);
            }
        }
    }

    MergeResult {
        merged_text: merged,
        has_conflict,
    }
}

fn push_marker(buffer: &mut String, marker: &str, label: &str) {
    buffer.push_str(marker);
    if !label.is_empty() {
        buffer.push(' ');
        buffer.push_str(label);
    }
    buffer.push('\n');
}

/// Markers must start on a line of their own, even after a last line without
/// terminator.
fn push_section(buffer: &mut String, lines: &[&str]) {
    buffer.extend(lines.iter().copied());
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
}

/// A normalisation applied to every input before merging.
pub type Formatter = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

/// [`merge_text`] with a configured formatter.
#[derive(Clone, Default)]
pub struct Merger {
    options: MergeOptions,
    formatter: Option<Arc<Formatter>>,
}

impl Merger {
    pub fn new(options: MergeOptions) -> Self {
        Self {
            options,
            formatter: None,
        }
    }

    /// Runs `formatter` over the working copy, the generated text and the
    /// base before diffing, so that formatting alone never conflicts.
    pub fn with_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    pub fn merge(
        &self,
        user: &str,
        generated: &str,
        base: Option<&str>,
    ) -> Result<Option<MergeResult>, MergeError> {
        let Some(format) = &self.formatter else {
            return Ok(merge_text(user, generated, base, &self.options));
        };

        let user = format(user).map_err(MergeError::Format)?;
        let generated = format(generated).map_err(MergeError::Format)?;
        let base = base.map(|base| format(base)).transpose().map_err(MergeError::Format)?;

        Ok(merge_text(&user, &generated, base.as_deref(), &self.options))
    }
}

impl fmt::Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger")
            .field("options", &self.options)
            .field("formatter", &self.formatter.is_some())
            .finish()
    }
}
