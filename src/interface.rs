use indexmap::IndexMap;

use crate::error::{EvalError, LoadError};
use crate::value::Value;

/// Caller-supplied data for one render.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: AsRef<str>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value.into());
        self
    }

    pub fn get<T: AsRef<str>>(&self, name: T) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<T: AsRef<str>>(&self, name: T) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(feature = "serde")]
impl TryFrom<serde_json::Value> for Context {
    type Error = serde_json::Value;

    /// Builds a context from a JSON object; anything else is handed back.
    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
            other @ (serde_json::Value::Null
            | serde_json::Value::Bool(_)
            | serde_json::Value::Number(_)
            | serde_json::Value::String(_)
            | serde_json::Value::Array(_)) => Err(other),
        }
    }
}

/// The mutable name-to-value bindings visible to expressions during one
/// compile. Seeded from the caller's [`Context`]; `set` writes into it and
/// `for` temporarily rebinds its loop variable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scope {
    vars: IndexMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Binds `name`, returning the value it shadowed.
    pub fn set<N: Into<String>>(&mut self, name: N, value: Value) -> Option<Value> {
        self.vars.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.shift_remove(name)
    }

    /// Puts back a binding saved by [`Scope::set`]: the prior value when there
    /// was one, otherwise the name is unbound again.
    pub fn restore(&mut self, name: &str, previous: Option<Value>) {
        match previous {
            Some(value) => {
                self.vars.insert(name.to_string(), value);
            }
            None => {
                self.vars.shift_remove(name);
            }
        }
    }
}

impl From<&Context> for Scope {
    fn from(context: &Context) -> Self {
        Self {
            vars: context.data.clone(),
        }
    }
}

/// Resolves a template name to its source text.
///
/// Implementations must not panic: a missing or unreadable template is
/// reported through the `Err` arm. The engine may call `read` several times
/// for the same name within one compile.
pub trait Loader {
    fn type_name(&self) -> &'static str;

    fn read(&self, name: &str) -> Result<String, LoadError>;
}

/// Evaluates one expression string against the current scope.
///
/// Must be deterministic for a given `(expression, scope)` pair.
pub trait Evaluator {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, EvalError>;
}

/// `NunchucksInterface` is the trait implemented by the template engine.
pub trait NunchucksInterface {
    /// `render` loads `template_name`, resolves inheritance and inclusion, runs
    /// control flow and substitutes every expression.
    ///
    /// # Errors
    /// - If the template or one of its parents cannot be loaded.
    /// - If the parents form an `extends` cycle.
    /// - If a tag is malformed or an expression fails to evaluate.
    fn render<N: AsRef<str>>(&self, template_name: N, context: &Context) -> crate::NunchucksResult<String>;

    /// `render_string` runs the runtime pipeline over a literal source. No
    /// `extends` or `include` resolution takes place.
    ///
    /// # Errors
    /// - If a tag is malformed or an expression fails to evaluate.
    fn render_string<S: AsRef<str>>(&self, source: S, context: &Context) -> crate::NunchucksResult<String>;

    /// `compile` resolves inheritance and inclusion only, returning the
    /// flattened source.
    ///
    /// # Errors
    /// - If the template or one of its parents cannot be loaded.
    /// - If the parents form an `extends` cycle.
    fn compile<N: AsRef<str>>(&self, template_name: N) -> crate::NunchucksResult<String>;
}
