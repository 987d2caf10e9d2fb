use std::path::PathBuf;

pub type NunchucksResult<T> = std::result::Result<T, NunchucksError>;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ParseErrorKind {
    /// A close delimiter with no open tag pending.
    #[error("unexpected close '{close}'")]
    UnexpectedClose { close: String },
    /// A second open delimiter while a tag is still pending.
    #[error("unterminated tag '{open}'")]
    UnterminatedTag { open: String },
    /// The close delimiter does not belong to the pending opener.
    #[error("incorrect syntax: '{open}' closed by '{close}'")]
    MismatchedClose { open: String, close: String },
    #[error("Expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("Unexpected EOF{expected_what}")]
    UnexpectedEOF {
        /// Describes what was expected, e.g., "(expected ')')"
        expected_what: String,
    },
    #[error("Invalid identifier starting with '{at_char}'")]
    InvalidIdentifier { at_char: String },
    #[error("Expected {description}")]
    Expected { description: String },
    #[error("Parser error: {0}")]
    Message(String),
}

impl ParseErrorKind {
    pub fn unexpected_eof(expected: Option<String>) -> Self {
        Self::UnexpectedEOF {
            expected_what: expected.map_or_else(String::new, |e| format!(" (expected '{}')", e)),
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("Parse error at line {line}, column {column}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    #[source]
    pub kind: ParseErrorKind,
}

/// Failure reported by a [`crate::Loader`]. Loaders return this instead of
/// panicking; the caller decides whether it is fatal.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{reason}")]
pub struct LoadError {
    pub name: String,
    pub reason: String,
}

impl LoadError {
    pub fn not_found<N: Into<String>>(name: N, shown: &str) -> Self {
        Self {
            name: name.into(),
            reason: format!("No file found: {}", shown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Syntax(#[from] ParseError),
    #[error("unknown filter '{name}'")]
    UnknownFilter { name: String },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("'{name}' is not callable")]
    NotCallable { name: String },
    #[error("filter '{name}' failed: {message}")]
    Filter { name: String, message: String },
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NunchucksError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Failed to load template '{}': {}", .0.name, .0.reason)]
    Load(#[source] LoadError),
    #[error("extends cycle detected: {}", chain.join(" -> "))]
    ExtendsCycle { chain: Vec<String> },
    #[error("Failed to evaluate `{expression}`: {source}")]
    Eval {
        expression: String,
        #[source]
        source: EvalError,
    },
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid output directory: {message}")]
    InvalidOutputDir { message: String },
}

impl From<LoadError> for NunchucksError {
    fn from(error: LoadError) -> Self {
        Self::Load(error)
    }
}

impl NunchucksError {
    pub(crate) fn eval<E: Into<String>>(expression: E, source: EvalError) -> Self {
        Self::Eval {
            expression: expression.into(),
            source,
        }
    }
}
