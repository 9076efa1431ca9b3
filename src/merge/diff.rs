//! Myers O(ND) line diff.

use std::ops::Range;

/// A region where `old[old]` was replaced by `new[new]`. Either range may be
/// empty, for pure insertions and deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hunk {
    pub old: Range<usize>,
    pub new: Range<usize>,
}

/// Returns the hunks turning `old` into `new`, in order. Lines between hunks
/// are equal on both sides.
pub(crate) fn diff(old: &[&str], new: &[&str]) -> Vec<Hunk> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];

    let mut hunks = Vec::new();
    let (mut i, mut j) = (0, 0);

    for (x, y) in matches(a, b).into_iter().chain([(a.len(), b.len())]) {
        if x > i || y > j {
            hunks.push(Hunk {
                old: prefix + i..prefix + x,
                new: prefix + j..prefix + y,
            });
        }
        i = x + 1;
        j = y + 1;
    }

    hunks
}

/// Pairs of equal lines `(i, j)` on a shortest edit path, in increasing order.
fn matches(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    if max == 0 {
        return Vec::new();
    }

    let offset = max as isize;
    let at = |k: isize| (k + offset) as usize;

    // furthest x reached on every diagonal k = x - y, one snapshot per round
    let mut v = vec![0isize; 2 * max + 1];
    let mut trace = Vec::new();

    'search: for d in 0..=offset {
        trace.push(v.clone());

        for k in (-d..=d).step_by(2) {
            let mut x = if k == -d || (k != d && v[at(k - 1)] < v[at(k + 1)]) {
                v[at(k + 1)]
            } else {
                v[at(k - 1)] + 1
            };
            let mut y = x - k;

            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }

            v[at(k)] = x;

            if x >= n && y >= m {
                break 'search;
            }
        }
    }

    let mut pairs = Vec::new();
    let (mut x, mut y) = (n, m);

    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;

        let prev_k = if k == -d || (k != d && v[at(k - 1)] < v[at(k + 1)]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[at(prev_k)];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            pairs.push((x as usize, y as usize));
        }

        if d > 0 {
            x = prev_x;
            y = prev_y;
        }
    }

    pairs.reverse();
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<&str> {
        text.split_inclusive('\n').collect()
    }

    /// Applies `hunks` to `old`, which must reproduce `new`.
    fn apply<'a>(old: &[&'a str], new: &[&'a str], hunks: &[Hunk]) -> Vec<&'a str> {
        let mut out = Vec::new();
        let mut at = 0;
        for hunk in hunks {
            out.extend_from_slice(&old[at..hunk.old.start]);
            out.extend_from_slice(&new[hunk.new.clone()]);
            at = hunk.old.end;
        }
        out.extend_from_slice(&old[at..]);
        out
    }

    #[test]
    fn identical_inputs_have_no_hunks() {
        let a = lines("a\nb\n");
        assert!(diff(&a, &a).is_empty());
        assert!(diff(&[], &[]).is_empty());
    }

    #[test]
    fn single_replacement() {
        let old = lines("A\nB\nC\n");
        let new = lines("A\nX\nC\n");
        assert_eq!(diff(&old, &new), vec![Hunk { old: 1..2, new: 1..2 }]);
    }

    #[test]
    fn insertions_and_deletions() {
        let old = lines("a\nb\nc\n");
        assert_eq!(diff(&old, &lines("a\nb\nx\nc\n")), vec![Hunk { old: 2..2, new: 2..3 }]);
        assert_eq!(diff(&old, &lines("a\nc\n")), vec![Hunk { old: 1..2, new: 1..1 }]);
        assert_eq!(diff(&[], &old), vec![Hunk { old: 0..0, new: 0..3 }]);
        assert_eq!(diff(&old, &[]), vec![Hunk { old: 0..3, new: 0..0 }]);
    }

    #[test]
    fn hunks_reconstruct_the_new_side() {
        let cases = [
            ("a\nb\nc\nd\ne\n", "b\nc\nx\ne\nf\n"),
            ("x\ny\nz\n", "z\ny\nx\n"),
            ("1\n2\n3\n4\n5\n6\n", "1\n3\n4\n7\n6\n8\n"),
            ("fn a() {}\n\nfn b() {}\n", "fn b() {}\n\nfn a() {}\n"),
        ];

        for (old, new) in cases {
            let (old, new) = (lines(old), lines(new));
            let hunks = diff(&old, &new);
            assert_eq!(apply(&old, &new, &hunks), new);
        }
    }

    #[test]
    fn line_terminators_are_significant() {
        let old = lines("a\nb");
        let new = lines("a\nb\n");
        assert_eq!(diff(&old, &new), vec![Hunk { old: 1..2, new: 1..2 }]);
    }
}
