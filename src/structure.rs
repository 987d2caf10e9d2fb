//! Structural resolution: `include`, `extends` and `block` merging, done on
//! source text before any control flow runs.

use std::{collections::HashSet, sync::LazyLock};

use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use tracing::{debug, trace, warn};

use crate::{
    NunchucksResult,
    edit::{Edit, apply_edits, outermost},
    error::{NunchucksError, ParseError},
    interface::Loader,
    scanner::{Span, keyword_and_rest, scan_statements},
};

/// Statement keywords that only shape a template. A line holding nothing but
/// these tags is removed after resolution.
pub const STRUCTURAL_KEYWORDS: &[&str] = &[
    "block", "endblock", "extends", "include", "client", "endclient", "only", "endonly",
];

static SUPER_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*super\(\)\s*\}\}").expect("valid super() pattern"));

/// A `{% block NAME %} ... {% endblock %}` region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub name: String,
    pub open: Span,
    pub close: Span,
    pub body_start: usize,
    pub body_end: usize,
}

impl BlockRecord {
    pub fn body<'s>(&self, source: &'s str) -> &'s str {
        source.get(self.body_start..self.body_end).unwrap_or_default()
    }
}

/// `"NAME"` or `'NAME'` with nothing after the closing quote.
fn quoted_name(rest: &str) -> Option<&str> {
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = rest.get(1..)?.strip_suffix(quote)?;
    (!inner.is_empty() && !inner.contains(['"', '\''])).then_some(inner)
}

/// The first `{% KEYWORD "NAME" %}` directive in `source`.
fn find_directive<'s>(
    source: &'s str,
    keyword: &str,
) -> Result<Option<(Span, &'s str)>, ParseError> {
    for span in scan_statements(source)? {
        let Some((kw, rest)) = keyword_and_rest(span.inner(source)) else {
            continue;
        };
        if kw != keyword {
            continue;
        }
        if let Some(name) = quoted_name(rest) {
            return Ok(Some((span, name)));
        }
    }
    Ok(None)
}

fn splice(source: &str, span: &Span, replacement: &str) -> String {
    apply_edits(source, vec![Edit::new(span.start.offset, span.end.offset, replacement)])
}

/// Replaces every `{% include "NAME" %}` in `source` with the resolved content
/// of `NAME`.
///
/// Names already in `seen` are cycles and resolve to nothing, as does any
/// include the loader fails to read. Neither is an error.
pub fn resolve_includes(
    source: &str,
    loader: &dyn Loader,
    seen: &HashSet<String>,
) -> Result<String, ParseError> {
    let mut out = source.to_string();
    while let Some((span, name)) = find_directive(&out, "include")? {
        let name = name.to_string();
        if seen.contains(&name) {
            warn!(template = %name, "dropping cyclic include");
            out = splice(&out, &span, "");
            continue;
        }

        let included = match loader.read(&name) {
            Ok(included) => included,
            Err(e) => {
                warn!(template = %name, loader = loader.type_name(), error = %e, "include failed to load");
                String::new()
            }
        };
        let mut nested_seen = seen.clone();
        nested_seen.insert(name.clone());
        let resolved = resolve_includes(&included, loader, &nested_seen)?;
        trace!(template = %name, len = resolved.len(), "resolved include");
        out = splice(&out, &span, &resolved);
    }
    Ok(out)
}

/// Stack-based block extraction. An unmatched `endblock` is ignored and when a
/// name repeats, the last closed block wins.
pub fn extract_blocks(source: &str) -> Result<IndexMap<String, BlockRecord>, ParseError> {
    let mut blocks = IndexMap::new();
    let mut stack: Vec<(String, Span)> = Vec::new();

    for span in scan_statements(source)? {
        match keyword_and_rest(span.inner(source)) {
            Some(("block", rest)) => {
                if let Some(name) = rest.split_whitespace().next() {
                    stack.push((name.to_string(), span));
                }
            }
            Some(("endblock", _)) => {
                let Some((name, open)) = stack.pop() else {
                    continue;
                };
                blocks.insert(
                    name.clone(),
                    BlockRecord {
                        name,
                        body_start: open.end.offset,
                        body_end: span.start.offset,
                        open,
                        close: span,
                    },
                );
            }
            _ => {}
        }
    }
    Ok(blocks)
}

/// Overlays the child's blocks onto the parent.
///
/// Each parent block the child also defines takes the child's body, with any
/// `{{ super() }}` in it replaced by the parent's original body. Everything
/// else in the child is discarded.
pub fn merge_extends(parent: &str, child: &str) -> Result<String, ParseError> {
    let parent_blocks = extract_blocks(parent)?;
    let child_blocks = extract_blocks(child)?;

    let edits: Vec<Edit> = parent_blocks
        .values()
        .filter_map(|parent_block| {
            let child_block = child_blocks.get(&parent_block.name)?;
            let parent_body = parent_block.body(parent);
            let body = SUPER_CALL.replace_all(child_block.body(child), NoExpand(parent_body));
            trace!(block = %parent_block.name, "overriding block");
            Some(Edit::new(
                parent_block.body_start,
                parent_block.body_end,
                body.into_owned(),
            ))
        })
        .collect();

    // An overridden block replaces any overridden blocks nested in it.
    let edits = outermost(edits, |e| e.start..e.end);
    Ok(apply_edits(parent, edits))
}

/// Resolves includes in the entry template, then walks its `extends` chain,
/// merging blocks at each step.
///
/// # Errors
/// - [`NunchucksError::ExtendsCycle`] when a parent repeats in the chain.
/// - [`NunchucksError::Load`] when a parent cannot be loaded.
/// - [`NunchucksError::Parse`] when a template has malformed tags.
pub fn resolve_extends_and_includes(
    entry_source: &str,
    entry_name: &str,
    loader: &dyn Loader,
) -> NunchucksResult<String> {
    let mut child = resolve_includes(entry_source, loader, &HashSet::from([entry_name.to_string()]))?;
    let mut chain = vec![entry_name.to_string()];

    loop {
        let Some((_, parent_name)) = find_directive(&child, "extends")? else {
            debug!(template = entry_name, depth = chain.len(), "structure resolved");
            return Ok(child);
        };
        let parent_name = parent_name.to_string();
        if chain.contains(&parent_name) {
            chain.push(parent_name);
            return Err(NunchucksError::ExtendsCycle { chain });
        }
        chain.push(parent_name.clone());

        let parent_source = loader.read(&parent_name).map_err(|e| {
            warn!(template = %parent_name, loader = loader.type_name(), error = %e, "parent failed to load");
            NunchucksError::from(e)
        })?;
        let parent = resolve_includes(&parent_source, loader, &HashSet::from([parent_name.clone()]))?;
        trace!(parent = %parent_name, depth = chain.len(), "merging extends");
        child = merge_extends(&parent, &child)?;
    }
}

/// True when `line`, minus surrounding spaces and tabs, is nothing but
/// statement tags whose keywords are all structural.
fn is_structural_line(line: &str, extra_keywords: &[String]) -> bool {
    let trimmed = line.trim_matches([' ', '\t']);
    if trimmed.is_empty() {
        return false;
    }
    let Ok(spans) = scan_statements(trimmed) else {
        return false;
    };
    let mut cursor = 0;
    for span in &spans {
        let gap = trimmed.get(cursor..span.start.offset).unwrap_or_default();
        if !gap.trim_matches([' ', '\t']).is_empty() {
            return false;
        }
        let structural = keyword_and_rest(span.inner(trimmed)).is_some_and(|(kw, _)| {
            STRUCTURAL_KEYWORDS.contains(&kw) || extra_keywords.iter().any(|extra| extra == kw)
        });
        if !structural {
            return false;
        }
        cursor = span.end.offset;
    }
    !spans.is_empty() && cursor == trimmed.len()
}

/// Deletes every line (with its line break) that holds only structural
/// directive tags. Tags sharing a line with other content are left alone.
pub fn strip_structural_lines(source: &str, extra_keywords: &[String]) -> String {
    source
        .split_inclusive('\n')
        .filter(|line| {
            let content = line.trim_end_matches(['\n', '\r']);
            !is_structural_line(content, extra_keywords)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn loader(templates: &[(&str, &str)]) -> MemoryLoader {
        templates.iter().copied().collect()
    }

    fn seen(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extends_override_with_super() {
        let loader = loader(&[("p", "<a>{% block x %}P{% endblock %}</a>")]);
        let child = "{% extends \"p\" %}{% block x %}C-{{ super() }}{% endblock %}";
        let out = resolve_extends_and_includes(child, "c", &loader).unwrap();
        assert_eq!(out, "<a>{% block x %}C-P{% endblock %}</a>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unoverridden_block_keeps_parent_body() {
        let parent = "{% block a %}A{% endblock %}|{% block b %}B{% endblock %}";
        let child = "{% block b %}child{% endblock %} stray text";
        assert_eq!(
            merge_extends(parent, child).unwrap(),
            "{% block a %}A{% endblock %}|{% block b %}child{% endblock %}"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_super_body_is_inserted_literally() {
        let parent = "{% block a %}cost: $1{% endblock %}";
        let child = "{% block a %}{{super()}} / {{ super() }}{% endblock %}";
        assert_eq!(
            merge_extends(parent, child).unwrap(),
            "{% block a %}cost: $1 / cost: $1{% endblock %}"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_override_defers_to_outer_block() {
        let parent = "{% block outer %}[{% block inner %}i{% endblock %}]{% endblock %}";
        let child = "{% block outer %}O{% endblock %}{% block inner %}I{% endblock %}";
        assert_eq!(
            merge_extends(parent, child).unwrap(),
            "{% block outer %}O{% endblock %}"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_multi_level_chain() {
        let loader = loader(&[
            ("base", "<{% block t %}base{% endblock %}>"),
            ("mid", "{% extends 'base' %}{% block t %}mid+{{ super() }}{% endblock %}"),
        ]);
        let child = "{% extends 'mid' %}{% block t %}leaf+{{ super() }}{% endblock %}";
        let out = resolve_extends_and_includes(child, "leaf", &loader).unwrap();
        assert_eq!(out, "<{% block t %}leaf+mid+base{% endblock %}>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extends_cycle_names_chain() {
        let loader = loader(&[
            ("a", "{% extends \"b\" %}"),
            ("b", "{% extends \"a\" %}"),
        ]);
        let err = resolve_extends_and_includes("{% extends \"b\" %}", "a", &loader).unwrap_err();
        assert!(matches!(err, NunchucksError::ExtendsCycle { ref chain } if chain == &["a", "b", "a"]));
        let message = err.to_string();
        assert!(message.contains('a') && message.contains('b'), "{message}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_parent_is_an_error() {
        let loader = loader(&[]);
        let err = resolve_extends_and_includes("{% extends 'gone' %}", "c", &loader).unwrap_err();
        assert!(matches!(err, NunchucksError::Load(ref e) if e.name == "gone"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_include_cycle_resolves_to_empty() {
        let loader = loader(&[("x", "x[{% include \"x\" %}]")]);
        let out = resolve_includes("{% include \"x\" %}", &loader, &seen(&["x"])).unwrap();
        assert_eq!(out, "");
        let out = resolve_includes("<{% include \"x\" %}>", &loader, &seen(&["page"])).unwrap();
        assert_eq!(out, "<x[]>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_include_resolves_to_empty() {
        let loader = loader(&[("a", "A")]);
        let out = resolve_includes("{% include 'a' %}-{% include 'nope' %}", &loader, &seen(&[])).unwrap();
        assert_eq!(out, "A-");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unquoted_include_is_left_alone() {
        let loader = loader(&[("a", "A")]);
        let out = resolve_includes("{% include a %}", &loader, &seen(&[])).unwrap();
        assert_eq!(out, "{% include a %}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extract_blocks_edge_cases() {
        let source = "{% endblock %}{% block a %}1{% endblock %}{% block a %}2{% endblock %}";
        let blocks = extract_blocks(source).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks["a"].body(source), "2");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_strip_structural_lines() {
        let source = "  {% block a %}\nkeep {% block b %} inline\n{% endblock %}{% endblock %}  \r\n{% if x %}\n{% custom %}\nend";
        assert_eq!(
            strip_structural_lines(source, &[]),
            "keep {% block b %} inline\n{% if x %}\n{% custom %}\nend"
        );
        assert_eq!(
            strip_structural_lines(source, &["custom".to_string()]),
            "keep {% block b %} inline\n{% if x %}\nend"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_strip_is_idempotent() {
        let source = "{% extends 'p' %}\n\t{% block a %}\ntext\n{% endblock %}\n{{ x }}\n";
        let once = strip_structural_lines(source, &[]);
        assert_eq!(once, "text\n{{ x }}\n");
        assert_eq!(strip_structural_lines(&once, &[]), once);
    }
}
