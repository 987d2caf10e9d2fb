//! The control-flow rewriter: `set`, `for` and `if` passes over source text.
//!
//! Each pass scans the statement tags of its input, matches openers with
//! closers on an explicit stack and rewrites the outermost matched constructs
//! in one batch of edits. Constructs nested inside them are handled when the
//! enclosing body is rendered.

use std::{ops::Range, sync::LazyLock};

use indexmap::IndexMap;
use regex::Regex;
use tracing::trace;

use crate::{
    NunchucksResult,
    edit::{Edit, apply_edits, outermost},
    scanner::{keyword_and_rest, scan_statements},
    template::{RenderCtx, render_string},
    value::Value,
};

static FOR_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_$][\w$]*)\s+in\s+([\s\S]+)$").expect("valid for header pattern")
});

static SET_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][\w$]*$").expect("valid set target pattern"));

/// Finds the first top-level separator in `s` at or after `from`.
///
/// `matcher` is offered each byte offset outside quotes and brackets and
/// returns the end of a separator starting there. Returns the separator's
/// start and end.
fn find_top_level<F>(s: &str, from: usize, matcher: F) -> Option<(usize, usize)>
where
    F: Fn(usize) -> Option<usize>,
{
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = from;
    while let Some(&b) = bytes.get(i) {
        match quote {
            Some(_) if b == b'\\' => i = i.saturating_add(1),
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' | b'[' | b'{' => depth = depth.saturating_add(1),
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                _ if depth == 0 => {
                    if let Some(end) = matcher(i) {
                        return Some((i, end));
                    }
                }
                _ => {}
            },
        }
        i = i.saturating_add(1);
    }
    None
}

fn split_top_level<F>(s: &str, matcher: F) -> Vec<&str>
where
    F: Fn(usize) -> Option<usize>,
{
    let mut parts = Vec::new();
    let mut last = 0;
    while let Some((start, end)) = find_top_level(s, last, &matcher) {
        parts.push(s.get(last..start).unwrap_or_default());
        last = end;
    }
    parts.push(s.get(last..).unwrap_or_default());
    parts
}

/// Matches whitespace, `keyword`, whitespace starting at `at`.
fn keyword_separator(s: &str, at: usize, keyword: &str) -> Option<usize> {
    let rest = s.get(at..)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let tail = rest.trim_start().strip_prefix(keyword)?;
    let after = tail.trim_start();
    (after.len() < tail.len()).then(|| s.len().saturating_sub(after.len()))
}

/// Matches a lone `=`, not part of `==`, `!=`, `<=` or `>=`.
fn assignment_separator(s: &str, at: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let prev = at.checked_sub(1).and_then(|p| bytes.get(p));
    let next = bytes.get(at.saturating_add(1));
    (bytes.get(at) == Some(&b'=')
        && !matches!(prev, Some(b'=' | b'!' | b'<' | b'>'))
        && next != Some(&b'='))
    .then(|| at.saturating_add(1))
}

/// The set pass: evaluates every `{% set NAME = EXPR %}` in `source` into the
/// scope, in source order. Several assignments may share one tag, separated
/// by commas. The source itself is not changed.
///
/// Malformed assignments are skipped.
pub(crate) fn apply_sets(source: &str, ctx: &mut RenderCtx<'_>) -> NunchucksResult<()> {
    for span in scan_statements(source)? {
        let Some(("set", rest)) = keyword_and_rest(span.inner(source)) else {
            continue;
        };
        let commas = |i: usize| (rest.as_bytes().get(i) == Some(&b',')).then(|| i.saturating_add(1));
        for assignment in split_top_level(rest, commas) {
            let Some((eq, after)) =
                find_top_level(assignment, 0, |i| assignment_separator(assignment, i))
            else {
                trace!(assignment, "skipping malformed set");
                continue;
            };
            let name = assignment.get(..eq).unwrap_or_default().trim();
            let expression = assignment.get(after..).unwrap_or_default().trim();
            if !SET_TARGET.is_match(name) || expression.is_empty() {
                trace!(assignment, "skipping malformed set");
                continue;
            }
            let value = ctx.evaluate(expression)?;
            trace!(name, "set");
            ctx.scope.set(name, value);
        }
    }
    Ok(())
}

/// A matched `{% for VAR in EXPR %} ... {% endfor %}`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopFrame {
    var_name: String,
    iterable: String,
    /// From the start of the opener to the end of the closer.
    tag_span: Range<usize>,
    body: Range<usize>,
}

/// The `loop` helper bound alongside the loop variable.
fn loop_info(index: usize, length: usize) -> Value {
    let mut info = IndexMap::new();
    info.insert("index".to_string(), Value::from(index.saturating_add(1)));
    info.insert("index0".to_string(), Value::from(index));
    info.insert("revindex".to_string(), Value::from(length.saturating_sub(index)));
    info.insert(
        "revindex0".to_string(),
        Value::from(length.saturating_sub(index).saturating_sub(1)),
    );
    info.insert("first".to_string(), Value::Bool(index == 0));
    info.insert("last".to_string(), Value::Bool(index.saturating_add(1) == length));
    info.insert("length".to_string(), Value::from(length));
    Value::Map(info)
}

fn render_loop(source: &str, frame: &LoopFrame, ctx: &mut RenderCtx<'_>) -> NunchucksResult<String> {
    let items = ctx.evaluate(&frame.iterable)?.iter_items();
    let body = source.get(frame.body.clone()).unwrap_or_default();
    trace!(var = %frame.var_name, iterations = items.len(), "expanding loop");

    let previous = ctx.scope.get(&frame.var_name).cloned();
    let previous_loop = ctx.scope.get("loop").cloned();
    let length = items.len();
    let mut out = String::new();
    let mut result = Ok(());
    for (index, item) in items.into_iter().enumerate() {
        ctx.scope.set("loop", loop_info(index, length));
        ctx.scope.set(frame.var_name.as_str(), item);
        match render_string(body, ctx).and_then(|chunk| apply_for_loops(&chunk, ctx)) {
            Ok(chunk) => out.push_str(&chunk),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    ctx.scope.restore("loop", previous_loop);
    ctx.scope.restore(&frame.var_name, previous);
    result.map(|()| out)
}

/// The for pass: replaces each outermost `for ... endfor` with the
/// concatenated rendering of its body, once per element of the iterable.
///
/// The loop variable (and `loop`) are restored afterwards, or unbound if they
/// were unbound before. Openers that are not `VAR in EXPR` and unmatched
/// closers are ignored.
pub(crate) fn apply_for_loops(source: &str, ctx: &mut RenderCtx<'_>) -> NunchucksResult<String> {
    let mut stack: Vec<(String, String, Range<usize>)> = Vec::new();
    let mut frames = Vec::new();

    for span in scan_statements(source)? {
        match keyword_and_rest(span.inner(source)) {
            Some(("for", rest)) => {
                let Some(caps) = FOR_HEADER.captures(rest) else {
                    trace!(header = rest, "skipping malformed for");
                    continue;
                };
                let var_name = caps.get(1).map_or("", |m| m.as_str()).to_string();
                let iterable = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
                stack.push((var_name, iterable, span.range()));
            }
            Some(("endfor", _)) => {
                let Some((var_name, iterable, open)) = stack.pop() else {
                    continue;
                };
                frames.push(LoopFrame {
                    var_name,
                    iterable,
                    tag_span: open.start..span.end.offset,
                    body: open.end..span.start.offset,
                });
            }
            Some(_) | None => {}
        }
    }

    let mut edits = Vec::new();
    for frame in outermost(frames, |f| f.tag_span.clone()) {
        let rendered = render_loop(source, &frame, ctx)?;
        edits.push(Edit::new(frame.tag_span.start, frame.tag_span.end, rendered));
    }
    Ok(apply_edits(source, edits))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    If,
    Elif,
    Else,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Branch {
    kind: BranchKind,
    condition: Option<String>,
    body: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IfContext {
    tag_span: Range<usize>,
    branches: Vec<Branch>,
}

/// Closes the open branch of `context` at `at`.
fn close_branch(context: &mut IfContext, at: usize) {
    if let Some(branch) = context.branches.last_mut() {
        branch.body.end = at;
    }
}

fn choose_branch<'s>(
    source: &'s str,
    context: &IfContext,
    ctx: &RenderCtx<'_>,
) -> NunchucksResult<&'s str> {
    for branch in &context.branches {
        let taken = match (branch.kind, &branch.condition) {
            (BranchKind::Else, _) => true,
            (BranchKind::If | BranchKind::Elif, Some(condition)) => eval_condition(condition, ctx)?,
            (BranchKind::If | BranchKind::Elif, None) => false,
        };
        if taken {
            return Ok(source.get(branch.body.clone()).unwrap_or_default());
        }
    }
    Ok("")
}

/// The if pass: replaces each outermost `if ... endif` group with the body of
/// its first branch whose condition holds, or of `else` once reached.
///
/// The chosen body goes through this pass again for the conditionals nested
/// inside it. `elif`, `else` and `endif` with no open `if` are ignored.
pub(crate) fn apply_if_else(source: &str, ctx: &RenderCtx<'_>) -> NunchucksResult<String> {
    let mut stack: Vec<IfContext> = Vec::new();
    let mut groups = Vec::new();

    for span in scan_statements(source)? {
        let Some((keyword, rest)) = keyword_and_rest(span.inner(source)) else {
            continue;
        };
        let condition = (!rest.is_empty()).then(|| rest.to_string());
        let kind = match keyword {
            "if" => {
                stack.push(IfContext {
                    tag_span: span.range(),
                    branches: vec![Branch {
                        kind: BranchKind::If,
                        condition,
                        body: span.end.offset..span.end.offset,
                    }],
                });
                continue;
            }
            "elif" => BranchKind::Elif,
            "else" => BranchKind::Else,
            "endif" => {
                let Some(mut context) = stack.pop() else {
                    continue;
                };
                close_branch(&mut context, span.start.offset);
                context.tag_span.end = span.end.offset;
                groups.push(context);
                continue;
            }
            _ => continue,
        };
        let Some(top) = stack.last_mut() else {
            continue;
        };
        close_branch(top, span.start.offset);
        top.branches.push(Branch {
            kind,
            condition: if kind == BranchKind::Elif { condition } else { None },
            body: span.end.offset..span.end.offset,
        });
    }

    let mut edits = Vec::new();
    for group in outermost(groups, |g| g.tag_span.clone()) {
        let chosen = choose_branch(source, &group, ctx)?;
        let rendered = apply_if_else(chosen, ctx)?;
        edits.push(Edit::new(group.tag_span.start, group.tag_span.end, rendered));
    }
    Ok(apply_edits(source, edits))
}

/// Evaluates an `if`/`elif` condition.
///
/// A leading `not` negates the rest. Otherwise the condition is split on
/// top-level `and` (all parts must hold) or, failing that, on `or` (any part
/// may hold), short-circuiting left to right. Anything else goes to the
/// evaluator whole. Mixed `and`/`or` is not given precedence: the split on
/// `and` happens first and each part goes to the evaluator as is.
pub(crate) fn eval_condition(condition: &str, ctx: &RenderCtx<'_>) -> NunchucksResult<bool> {
    let condition = condition.trim();

    if let Some(negated) = condition
        .strip_prefix("not")
        .filter(|rest| rest.starts_with(char::is_whitespace))
    {
        return Ok(!ctx.evaluate(negated.trim())?.is_truthy());
    }

    let and_parts = split_top_level(condition, |i| keyword_separator(condition, i, "and"));
    if and_parts.len() > 1 {
        for part in and_parts {
            if !ctx.evaluate(part.trim())?.is_truthy() {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let or_parts = split_top_level(condition, |i| keyword_separator(condition, i, "or"));
    if or_parts.len() > 1 {
        for part in or_parts {
            if ctx.evaluate(part.trim())?.is_truthy() {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    Ok(ctx.evaluate(condition)?.is_truthy())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        error::EvalError,
        eval::ExpressionEvaluator,
        interface::{Context, Evaluator, Scope},
    };

    /// Records every expression it is asked for and answers with the
    /// built-in evaluator.
    #[derive(Default)]
    struct Recording {
        inner: ExpressionEvaluator,
        seen: RefCell<Vec<String>>,
    }

    impl Evaluator for Recording {
        fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, EvalError> {
            self.seen.borrow_mut().push(expression.to_string());
            self.inner.evaluate(expression, scope)
        }
    }

    fn scope() -> Scope {
        let mut context = Context::new();
        context
            .insert("yes", true)
            .insert("no", false)
            .insert("items", vec![1, 2])
            .insert("nested", vec![vec!["a", "b"], vec!["c"]]);
        Scope::from(&context)
    }

    fn with_ctx<T>(f: impl FnOnce(&mut RenderCtx<'_>) -> T) -> T {
        let evaluator = ExpressionEvaluator::new();
        let mut ctx = RenderCtx::new(scope(), &evaluator, &[]);
        f(&mut ctx)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_split_top_level_respects_quotes_and_brackets() {
        let s = "a = 1, b = 'x,y', c = [1, 2]";
        let parts = split_top_level(s, |i| (s.as_bytes().get(i) == Some(&b',')).then(|| i.saturating_add(1)));
        assert_eq!(parts, vec!["a = 1", " b = 'x,y'", " c = [1, 2]"]);

        let cond = "x == ' and ' and y";
        let parts = split_top_level(cond, |i| keyword_separator(cond, i, "and"));
        assert_eq!(parts, vec!["x == ' and '", "y"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_assigns_into_scope() {
        with_ctx(|ctx| {
            apply_sets("{% set a = 1, b = 'x,y' %}{% set c = a + 1 %}{% set bad %}", ctx).unwrap();
            assert_eq!(ctx.scope.get("a"), Some(&Value::Int(1)));
            assert_eq!(ctx.scope.get("b"), Some(&Value::from("x,y")));
            assert_eq!(ctx.scope.get("c"), Some(&Value::Int(2)));
            assert!(!ctx.scope.contains("bad"));
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_set_with_comparison_on_the_right() {
        with_ctx(|ctx| {
            apply_sets("{% set same = 1 == 1 %}", ctx).unwrap();
            assert_eq!(ctx.scope.get("same"), Some(&Value::Bool(true)));
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_for_restores_and_removes_loop_variable() {
        with_ctx(|ctx| {
            let out = apply_for_loops("{% for i in items %}{{ i }}{% endfor %}", ctx).unwrap();
            assert_eq!(out, "12");
            assert!(!ctx.scope.contains("i"));
            assert!(!ctx.scope.contains("loop"));

            ctx.scope.set("i", Value::from("outer"));
            apply_for_loops("{% for i in items %}{% endfor %}", ctx).unwrap();
            assert_eq!(ctx.scope.get("i"), Some(&Value::from("outer")));
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_loops() {
        with_ctx(|ctx| {
            let source = "{% for row in nested %}[{% for cell in row %}{{ cell }}{% endfor %}]{% endfor %}";
            assert_eq!(apply_for_loops(source, ctx).unwrap(), "[ab][c]");
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_helper() {
        with_ctx(|ctx| {
            let source = "{% for i in items %}{{ loop.index }}/{{ loop.length }}{% if loop.last %}.{% else %},{% endif %}{% endfor %}";
            assert_eq!(apply_for_loops(source, ctx).unwrap(), "1/2,2/2.");
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_iterable_coercion() {
        with_ctx(|ctx| {
            ctx.scope.set("map", [("k", "v1"), ("j", "v2")].into_iter().collect());
            ctx.scope.set("scalar", Value::Int(5));
            let out = apply_for_loops(
                "{% for v in map %}{{ v }}{% endfor %}|{% for v in nothing %}x{% endfor %}|{% for v in scalar %}{{ v }}{% endfor %}",
                ctx,
            )
            .unwrap();
            assert_eq!(out, "v1v2||5");
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_and_unmatched_for_tags_are_left() {
        with_ctx(|ctx| {
            let source = "{% endfor %}{% for x items %}";
            assert_eq!(apply_for_loops(source, ctx).unwrap(), source);
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_first_match_wins() {
        let evaluator = Recording::default();
        let ctx = RenderCtx::new(scope(), &evaluator, &[]);
        let source = "{% if no %}A{% elif yes %}B{% elif yes %}C{% else %}D{% endif %}";
        assert_eq!(apply_if_else(source, &ctx).unwrap(), "B");
        // Short-circuit: the third branch's condition is never evaluated.
        assert_eq!(*evaluator.seen.borrow(), vec!["no", "yes"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_if_without_match_or_else_is_empty() {
        with_ctx(|ctx| {
            assert_eq!(apply_if_else("<{% if no %}A{% endif %}>", ctx).unwrap(), "<>");
            assert_eq!(apply_if_else("<{% if %}A{% else %}B{% endif %}>", ctx).unwrap(), "<B>");
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_nested_if_resolves_inside_chosen_branch() {
        with_ctx(|ctx| {
            let source = "{% if yes %}({% if no %}x{% else %}y{% endif %}){% else %}{% if yes %}z{% endif %}{% endif %}";
            assert_eq!(apply_if_else(source, ctx).unwrap(), "(y)");
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_eval_condition_forms() {
        with_ctx(|ctx| {
            assert!(eval_condition("not no", ctx).unwrap());
            assert!(eval_condition("yes and items", ctx).unwrap());
            assert!(!eval_condition("yes and no", ctx).unwrap());
            assert!(eval_condition("no or yes", ctx).unwrap());
            assert!(!eval_condition("no or missing", ctx).unwrap());
            assert!(eval_condition("nothere is not defined", ctx).unwrap());
            assert!(eval_condition("notes is not defined", ctx).unwrap());
        });
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_and_short_circuits() {
        let evaluator = Recording::default();
        let ctx = RenderCtx::new(scope(), &evaluator, &[]);
        assert!(!eval_condition("no and yes and items", &ctx).unwrap());
        assert_eq!(*evaluator.seen.borrow(), vec!["no"]);
    }
}
