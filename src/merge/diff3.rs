//! diff3 chunking of two edits against a common base.

use super::diff::{Hunk, diff};

/// One region of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// Lines neither side touched.
    Stable(&'a [&'a str]),
    /// Lines changed in the working copy only.
    Edited(&'a [&'a str]),
    /// Lines changed by the generator only, or changed identically by both.
    Resolved(&'a [&'a str]),
    /// Overlapping edits with different results.
    Conflict {
        user: &'a [&'a str],
        base: &'a [&'a str],
        generated: &'a [&'a str],
    },
}

impl Chunk<'_> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Chunk::Conflict { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    User,
    Generated,
}

/// Splits a three-way merge into chunks, in base order.
///
/// Both sides are diffed against `base`. Hunks whose base ranges overlap or
/// touch are grouped into one region; a region edited by one side only takes
/// that side's lines, a region edited by both sides is a conflict unless both
/// produced the same lines.
pub fn diff3<'a>(user: &'a [&'a str], base: &'a [&'a str], generated: &'a [&'a str]) -> Vec<Chunk<'a>> {
    let mut hunks: Vec<(Side, Hunk)> = diff(base, user)
        .into_iter()
        .map(|hunk| (Side::User, hunk))
        .chain(diff(base, generated).into_iter().map(|hunk| (Side::Generated, hunk)))
        .collect();
    hunks.sort_by_key(|(_, hunk)| (hunk.old.start, hunk.old.end));

    let mut chunks = Vec::new();
    let mut stable_from = 0;
    let mut i = 0;

    while i < hunks.len() {
        let region_start = hunks[i].1.old.start;
        let mut region_end = hunks[i].1.old.end;
        let mut j = i + 1;
        while j < hunks.len() && hunks[j].1.old.start <= region_end {
            region_end = region_end.max(hunks[j].1.old.end);
            j += 1;
        }
        let region = &hunks[i..j];

        if stable_from < region_start {
            chunks.push(Chunk::Stable(&base[stable_from..region_start]));
        }

        let user_lines = side_lines(region, Side::User, user, base, region_start, region_end);
        let generated_lines =
            side_lines(region, Side::Generated, generated, base, region_start, region_end);

        match (user_lines, generated_lines) {
            (Some(lines), None) => chunks.push(Chunk::Edited(lines)),
            (None, Some(lines)) => chunks.push(Chunk::Resolved(lines)),
            (Some(user), Some(generated)) if user == generated => {
                chunks.push(Chunk::Resolved(user));
            }
            (Some(user), Some(generated)) => chunks.push(Chunk::Conflict {
                user,
                base: &base[region_start..region_end],
                generated,
            }),
            (None, None) => {}
        }

        stable_from = region_end;
        i = j;
    }

    if stable_from < base.len() {
        chunks.push(Chunk::Stable(&base[stable_from..]));
    }

    chunks
}

/// The lines `side` has in place of `base[start..end]`, or `None` when that
/// side left the region untouched.
fn side_lines<'a>(
    region: &[(Side, Hunk)],
    side: Side,
    lines: &'a [&'a str],
    base: &'a [&'a str],
    start: usize,
    end: usize,
) -> Option<&'a [&'a str]> {
    let mut hunks = region.iter().filter(|(s, _)| *s == side).map(|(_, h)| h);
    let first = hunks.next()?;
    let last = hunks.last().unwrap_or(first);

    // unchanged lines at the region edges are shared with the base
    let from = first.new.start - (first.old.start - start);
    let to = last.new.end + (end - last.old.end);
    debug_assert!(to <= lines.len() && base.len() >= end);

    Some(&lines[from..to])
}
