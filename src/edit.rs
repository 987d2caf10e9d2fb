//! Batched textual substitutions.
//!
//! Every rewrite pass records its replacements against the offsets of the
//! source it scanned and applies them in one batch, highest `start` first, so
//! an applied edit never shifts the offsets of the ones still pending.

use std::ops::Range;

use tracing::trace;

/// A pending substitution of `source[start..end]` by `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edit {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

impl Edit {
    pub fn new<R: Into<String>>(start: usize, end: usize, replacement: R) -> Self {
        Self {
            start,
            end,
            replacement: replacement.into(),
        }
    }

    pub fn delete(start: usize, end: usize) -> Self {
        Self::new(start, end, String::new())
    }
}

/// Keeps the items whose range is not enclosed by another item's range, in
/// order of their start offset.
///
/// Passes that resolve nested constructs render the inner construct as part
/// of the outer one, so only the outermost constructs produce edits.
pub(crate) fn outermost<T, F>(items: Vec<T>, range: F) -> Vec<T>
where
    F: Fn(&T) -> Range<usize>,
{
    let ranges: Vec<Range<usize>> = items.iter().map(&range).collect();
    let enclosed = |inner: &Range<usize>| {
        ranges
            .iter()
            .any(|outer| outer != inner && outer.start <= inner.start && inner.end <= outer.end)
    };
    let mut kept: Vec<T> = items
        .into_iter()
        .zip(ranges.iter())
        .filter(|(_, r)| !enclosed(*r))
        .map(|(item, _)| item)
        .collect();
    kept.sort_by_key(|item| range(item).start);
    kept
}

/// Applies `edits` to `source` in descending `start` order.
///
/// The edits must not overlap one another. Edits whose range falls outside
/// `source` or off a character boundary are skipped.
pub fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    if edits.is_empty() {
        return source.to_string();
    }
    edits.sort_by(|a, b| b.start.cmp(&a.start));

    let mut out = source.to_string();
    for edit in edits {
        if edit.start > edit.end || out.get(edit.start..edit.end).is_none() {
            trace!(start = edit.start, end = edit.end, "skipping out-of-range edit");
            continue;
        }
        trace!(start = edit.start, end = edit.end, len = edit.replacement.len(), "apply edit");
        out.replace_range(edit.start..edit.end, &edit.replacement);
    }
    out
}
