//! The built-in [`Evaluator`]: parses an expression with the crate's parser
//! and walks the result against a [`Scope`].
//!
//! Lookups are lenient. Unbound names, missing attributes and out-of-range
//! indexes evaluate to `null`, which renders as an empty string. Unknown
//! filters and functions are errors.

use std::{collections::HashMap, fmt};

use crate::{
    ast::{ArithOp, CompareOp, Expr},
    error::EvalError,
    filters,
    interface::{Evaluator, Scope},
    parser::parse_expression,
    value::Value,
};

/// A user-registered filter: receives the piped value and the call arguments.
pub type FilterFn = dyn Fn(&Value, &[Value]) -> Result<Value, EvalError> + Send + Sync;

/// A user-registered function, callable as `name(args...)`.
pub type FunctionFn = dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync;

#[derive(Default)]
pub struct ExpressionEvaluator {
    filters: HashMap<String, Box<FilterFn>>,
    functions: HashMap<String, Box<FunctionFn>>,
}

impl fmt::Debug for ExpressionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut filters: Vec<&String> = self.filters.keys().collect();
        filters.sort();
        let mut functions: Vec<&String> = self.functions.keys().collect();
        functions.sort();
        f.debug_struct("ExpressionEvaluator")
            .field("filters", &filters)
            .field("functions", &functions)
            .finish()
    }
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter. A custom filter shadows a built-in of the same name.
    pub fn add_filter<N, F>(&mut self, name: N, filter: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&Value, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Box::new(filter));
        self
    }

    /// Registers a function callable from expressions.
    pub fn add_function<N, F>(&mut self, name: N, function: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
        self
    }

    fn eval_all(&self, exprs: &[Expr], scope: &Scope) -> Result<Vec<Value>, EvalError> {
        exprs.iter().map(|e| self.eval(e, scope)).collect()
    }

    fn eval(&self, expr: &Expr, scope: &Scope) -> Result<Value, EvalError> {
        let value = match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Array(items) => Value::Array(self.eval_all(items, scope)?),
            Expr::Variable(name) => scope.get(name).cloned().unwrap_or_default(),
            Expr::Attribute { target, name } => attribute(&self.eval(target, scope)?, name),
            Expr::Index { target, index } => {
                let target = self.eval(target, scope)?;
                let index = self.eval(index, scope)?;
                index_value(&target, &index)
            }
            Expr::Call { callee, args } => {
                let args = self.eval_all(args, scope)?;
                self.call(callee, &args)?
            }
            Expr::Filter { target, name, args } => {
                let value = self.eval(target, scope)?;
                let args = self.eval_all(args, scope)?;
                self.apply_filter(name, &value, &args)?
            }
            Expr::Not(inner) => Value::Bool(!self.eval(inner, scope)?.is_truthy()),
            Expr::And { left, right } => {
                Value::Bool(self.eval(left, scope)?.is_truthy() && self.eval(right, scope)?.is_truthy())
            }
            Expr::Or { left, right } => {
                Value::Bool(self.eval(left, scope)?.is_truthy() || self.eval(right, scope)?.is_truthy())
            }
            Expr::Compare { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Value::Bool(compare(*op, &left, &right))
            }
            Expr::In {
                item,
                container,
                negated,
            } => {
                let item = self.eval(item, scope)?;
                let container = self.eval(container, scope)?;
                Value::Bool(contains(&container, &item) != *negated)
            }
            Expr::Test {
                target,
                name,
                args,
                negated,
            } => {
                let value = self.eval(target, scope)?;
                let args = self.eval_all(args, scope)?;
                Value::Bool(filters::apply_test(name, &value, &args)? != *negated)
            }
            Expr::Arith { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                arithmetic(*op, &left, &right)
            }
            Expr::Neg(inner) => match self.eval(inner, scope)? {
                Value::Int(i) => i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int),
                other => Value::Float(-other.as_f64().unwrap_or(0.0)),
            },
            Expr::Conditional {
                then,
                condition,
                otherwise,
            } => {
                if self.eval(condition, scope)?.is_truthy() {
                    self.eval(then, scope)?
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise, scope)?
                } else {
                    Value::Null
                }
            }
        };
        Ok(value)
    }

    fn apply_filter(&self, name: &str, value: &Value, args: &[Value]) -> Result<Value, EvalError> {
        if let Some(filter) = self.filters.get(name) {
            return filter(value, args);
        }
        filters::apply_builtin(name, value, args).unwrap_or_else(|| {
            Err(EvalError::UnknownFilter {
                name: name.to_string(),
            })
        })
    }

    fn call(&self, callee: &Expr, args: &[Value]) -> Result<Value, EvalError> {
        let Expr::Variable(name) = callee else {
            return Err(EvalError::NotCallable {
                name: describe(callee),
            });
        };
        if let Some(function) = self.functions.get(name) {
            return function(args);
        }
        match name.as_str() {
            "range" => filters::range(args),
            // A `super()` left outside any overriding block has nothing to
            // pull in.
            "super" => Ok(Value::Null),
            _ => Err(EvalError::UnknownFunction { name: name.clone() }),
        }
    }
}

impl Evaluator for ExpressionEvaluator {
    fn evaluate(&self, expression: &str, scope: &Scope) -> Result<Value, EvalError> {
        let expr = parse_expression(expression)?;
        self.eval(&expr, scope)
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Variable(name) => name.clone(),
        Expr::Attribute { target, name } => format!("{}.{}", describe(target), name),
        Expr::Index { target, .. } => format!("{}[]", describe(target)),
        Expr::Literal(value) => value.type_name().to_string(),
        Expr::Call { callee, .. } => format!("{}()", describe(callee)),
        Expr::Array(_)
        | Expr::Filter { .. }
        | Expr::Not(_)
        | Expr::And { .. }
        | Expr::Or { .. }
        | Expr::Compare { .. }
        | Expr::In { .. }
        | Expr::Test { .. }
        | Expr::Arith { .. }
        | Expr::Neg(_)
        | Expr::Conditional { .. } => "expression".to_string(),
    }
}

fn attribute(target: &Value, name: &str) -> Value {
    match target {
        Value::Map(map) => map.get(name).cloned().unwrap_or_default(),
        Value::Array(items) => match name.parse::<usize>() {
            Ok(i) => items.get(i).cloned().unwrap_or_default(),
            Err(_) if name == "length" => Value::from(items.len()),
            Err(_) => Value::Null,
        },
        Value::String(s) if name == "length" => Value::from(s.chars().count()),
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_) => {
            Value::Null
        }
    }
}

/// Resolves a possibly negative index against a length.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        usize::try_from(index).ok()
    } else {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match target {
        Value::Map(map) => map.get(&index.to_string()).cloned().unwrap_or_default(),
        Value::Array(items) => index
            .as_i64()
            .and_then(|i| resolve_index(i, items.len()))
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or_default(),
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            index
                .as_i64()
                .and_then(|i| resolve_index(i, chars.len()))
                .and_then(|i| chars.get(i))
                .map_or(Value::Null, |c| Value::String(c.to_string()))
        }
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => Value::Null,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => left.loose_eq(right),
        CompareOp::Ne => !left.loose_eq(right),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => match a.partial_cmp(&b) {
                    Some(ordering) => ordering,
                    None => return false,
                },
                _ => left.to_string().cmp(&right.to_string()),
            };
            match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge | CompareOp::Eq | CompareOp::Ne => ordering.is_ge(),
            }
        }
    }
}

fn contains(container: &Value, item: &Value) -> bool {
    match container {
        Value::String(s) => s.contains(&item.to_string()),
        Value::Array(items) => items.iter().any(|v| v.loose_eq(item)),
        Value::Map(map) => map.contains_key(&item.to_string()),
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => false,
    }
}

fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Value {
    match (op, left, right) {
        (ArithOp::Concat, _, _)
        | (ArithOp::Add, Value::String(_), _)
        | (ArithOp::Add, _, Value::String(_)) => Value::String(format!("{}{}", left, right)),
        (ArithOp::Add, Value::Array(a), Value::Array(b)) => {
            Value::Array(a.iter().chain(b.iter()).cloned().collect())
        }
        (_, Value::Int(a), Value::Int(b)) => integer_arithmetic(op, *a, *b),
        _ => {
            let a = left.as_f64().unwrap_or(0.0);
            let b = right.as_f64().unwrap_or(0.0);
            float_arithmetic(op, a, b)
        }
    }
}

fn integer_arithmetic(op: ArithOp, a: i64, b: i64) -> Value {
    let checked = match op {
        ArithOp::Add => a.checked_add(b),
        ArithOp::Sub => a.checked_sub(b),
        ArithOp::Mul => a.checked_mul(b),
        ArithOp::Rem if b == 0 => return Value::Null,
        ArithOp::Rem => a.checked_rem(b),
        ArithOp::Div | ArithOp::Concat => None,
    };
    checked.map_or_else(|| float_arithmetic(op, a as f64, b as f64), Value::Int)
}

fn float_arithmetic(op: ArithOp, a: f64, b: f64) -> Value {
    match op {
        ArithOp::Add => Value::Float(a + b),
        ArithOp::Sub => Value::Float(a - b),
        ArithOp::Mul => Value::Float(a * b),
        ArithOp::Div | ArithOp::Rem if b == 0.0 => Value::Null,
        ArithOp::Div => Value::Float(a / b),
        ArithOp::Rem => Value::Float(a % b),
        ArithOp::Concat => Value::String(format!("{}{}", Value::Float(a), Value::Float(b))),
    }
}
