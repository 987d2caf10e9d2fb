use crate::value::Value;

/// Names accepted after `is`. Anything else is parsed as `a is b` equality.
pub(crate) const TEST_NAMES: &[&str] = &[
    "defined",
    "undefined",
    "none",
    "null",
    "string",
    "number",
    "boolean",
    "bool",
    "iterable",
    "callable",
    "odd",
    "even",
    "divisibleby",
    "lower",
    "upper",
    "equalto",
    "sameas",
    "sequence",
    "mapping",
    "true",
    "false",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    /// `~`, string concatenation regardless of operand types.
    Concat,
}

/// An expression from inside a `{{ }}` tag or a directive argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    /// A string, number, boolean or null literal.
    Literal(Value),
    /// `[a, b, c]`
    Array(Vec<Expr>),
    /// A bare name looked up in the scope.
    Variable(String),
    /// `target.name`
    Attribute { target: Box<Expr>, name: String },
    /// `target[index]`
    Index { target: Box<Expr>, index: Box<Expr> },
    /// `callee(args...)`
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// `target | name(args...)`
    Filter {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// Conditional NOT
    Not(Box<Expr>),
    /// Conditional AND
    And { left: Box<Expr>, right: Box<Expr> },
    /// Conditional OR
    Or { left: Box<Expr>, right: Box<Expr> },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `item in container`, or `item not in container` when `negated`.
    In {
        item: Box<Expr>,
        container: Box<Expr>,
        negated: bool,
    },
    /// `target is name(args...)`, or `is not` when `negated`.
    Test {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    /// `then if condition else otherwise`
    Conditional {
        then: Box<Expr>,
        condition: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
}
