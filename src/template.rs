use std::borrow::Cow;

use tracing::debug;

use crate::{
    NunchucksResult,
    control::{apply_for_loops, apply_if_else, apply_sets},
    edit::{Edit, apply_edits},
    error::NunchucksError,
    interface::{Context, Evaluator, Scope},
    scanner::{TagKind, keyword_and_rest, scan},
    structure::STRUCTURAL_KEYWORDS,
    value::Value,
};

/// Control-flow keywords. Their tags have been consumed by the time the final
/// pass runs and any leftovers render as nothing.
pub const CONTROL_KEYWORDS: &[&str] = &["set", "if", "elif", "else", "endif", "for", "endfor"];

/// State shared by every pass of one render: the variable scope and the
/// collaborators that expressions are evaluated with.
pub(crate) struct RenderCtx<'a> {
    pub(crate) scope: Scope,
    evaluator: &'a dyn Evaluator,
    extra_keywords: &'a [String],
}

impl<'a> RenderCtx<'a> {
    pub(crate) fn new(scope: Scope, evaluator: &'a dyn Evaluator, extra_keywords: &'a [String]) -> Self {
        Self {
            scope,
            evaluator,
            extra_keywords,
        }
    }

    /// Evaluates `expression` in the current scope.
    pub(crate) fn evaluate(&self, expression: &str) -> NunchucksResult<Value> {
        self.evaluator
            .evaluate(expression, &self.scope)
            .map_err(|e| NunchucksError::eval(expression, e))
    }

    /// Whether a statement starting with `keyword` is a directive that
    /// produces no output of its own.
    fn is_directive(&self, keyword: &str) -> bool {
        CONTROL_KEYWORDS.contains(&keyword)
            || STRUCTURAL_KEYWORDS.contains(&keyword)
            || self.extra_keywords.iter().any(|k| k == keyword)
    }
}

/// Replaces every remaining tag in `source` with its evaluated text.
///
/// Expression tags and non-directive statement tags are evaluated; a `null`
/// result and directive statements become the empty string.
fn substitute(source: &str, ctx: &RenderCtx<'_>) -> NunchucksResult<String> {
    let mut edits = Vec::new();
    for span in scan(source)? {
        let inner = span.inner(source);
        let silent = inner.is_empty()
            || (span.kind() == TagKind::Statement
                && keyword_and_rest(inner).is_some_and(|(kw, _)| ctx.is_directive(kw)));
        let replacement = if silent {
            String::new()
        } else {
            ctx.evaluate(inner)?.render()
        };
        edits.push(Edit::new(span.start.offset, span.end.offset, replacement));
    }
    Ok(apply_edits(source, edits))
}

/// Runs the runtime pipeline over `source`: the set pass, the for pass, the
/// if pass and finally substitution of every remaining tag.
///
/// Loop bodies re-enter this function once per iteration.
///
/// # Errors
///
/// Returns an error when a tag is malformed or an expression fails to
/// evaluate.
pub(crate) fn render_string(source: &str, ctx: &mut RenderCtx<'_>) -> NunchucksResult<String> {
    apply_sets(source, ctx)?;
    let out = apply_for_loops(source, ctx)?;
    debug!(len = out.len(), "for pass");
    let out = apply_if_else(&out, ctx)?;
    debug!(len = out.len(), "if pass");
    let out = substitute(&out, ctx)?;
    debug!(len = out.len(), "final substitution");
    Ok(out)
}

/// A Template is a template source whose tags have been checked, ready to be
/// rendered any number of times.
///
/// `extends` and `include` are not resolved here; that needs a loader and is
/// done by [`crate::Environment::compile`]. A template built from compiled
/// output renders exactly like [`crate::Environment::render`].
///
/// # Example
///
/// ```rust
/// use nunchucks::{Context, ExpressionEvaluator, Template};
///
/// let template = Template::new("Hello, {{ name | title }}!").unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "world");
///
/// let result = template.render(&ExpressionEvaluator::new(), &context).unwrap();
/// assert_eq!(result, "Hello, World!");
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template<'a> {
    content: Cow<'a, str>,
    name: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    extra_keywords: Vec<String>,
}

impl<'c> Template<'c> {
    /// Creates a new template, checking that every tag is well formed.
    ///
    /// # Arguments
    ///
    /// * `content` - The template source
    ///
    /// # Errors
    ///
    /// Returns a `NunchucksError::Parse` error if a tag delimiter is unexpected,
    /// mismatched or left open.
    pub fn new<T: Into<Cow<'c, str>>>(content: T) -> NunchucksResult<Self> {
        let content: Cow<'c, str> = content.into();
        scan(&content)?;
        Ok(Self {
            content,
            name: None,
            extra_keywords: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Extra statement keywords that render as nothing, on top of the built-in
    /// control and structural directives.
    #[must_use]
    pub fn with_extra_keywords(mut self, keywords: Vec<String>) -> Self {
        self.extra_keywords = keywords;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.content
    }

    /// Renders the template against `context`.
    ///
    /// The context seeds a fresh scope, so `set` and loop bindings made during
    /// this render are not visible to the next one.
    ///
    /// # Arguments
    ///
    /// * `evaluator` - Evaluates the expressions found in tags
    /// * `context` - The caller's data
    ///
    /// # Errors
    ///
    /// Returns `NunchucksError::Parse` for malformed tags produced while
    /// rendering and `NunchucksError::Eval` when an expression fails.
    pub fn render(&self, evaluator: &dyn Evaluator, context: &Context) -> NunchucksResult<String> {
        let mut ctx = RenderCtx::new(Scope::from(context), evaluator, &self.extra_keywords);
        let out = render_string(&self.content, &mut ctx)?;
        debug!(template = self.name().unwrap_or("<string>"), len = out.len(), "rendered");
        Ok(out)
    }
}
