mod ast;
mod config;
mod control;
pub mod edit;
mod engine;
mod error;
mod eval;
mod filters;
mod interface;
mod loader;
mod parser;
pub mod scanner;
pub mod structure;
mod template;
mod value;

// Public exports.
pub use config::ConfigOptions;
pub use edit::{Edit, apply_edits};
pub use engine::{Environment, TEMPLATE_EXTENSIONS};
pub use error::{EvalError, LoadError, NunchucksError, NunchucksResult, ParseError, ParseErrorKind};
pub use eval::{ExpressionEvaluator, FilterFn, FunctionFn};
pub use interface::{Context, Evaluator, Loader, NunchucksInterface, Scope};
pub use loader::{FileSystemLoader, MemoryLoader};
pub use scanner::{Marker, Span, TagKind, scan};
pub use template::Template;
pub use value::Value;
