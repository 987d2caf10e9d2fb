use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::{
    NunchucksResult,
    config::ConfigOptions,
    error::{EvalError, NunchucksError},
    eval::ExpressionEvaluator,
    interface::{Context, Loader, NunchucksInterface, Scope},
    loader::{DEFAULT_ROOT, FileSystemLoader},
    structure::{resolve_extends_and_includes, strip_structural_lines},
    template::{RenderCtx, render_string},
    value::Value,
};

/// File extensions picked up by [`Environment::precompile_dir`].
pub const TEMPLATE_EXTENSIONS: &[&str] = &["njk", "html", "txt", "yaml", "yml", "json", "xml", "css", "js"];

/// `Environment` is the primary implementation of the [`NunchucksInterface`]
/// trait. It owns a [`Loader`] to fetch templates by name and an
/// [`ExpressionEvaluator`] for the expressions inside tags.
///
/// Every render starts from a fresh scope seeded from the caller's
/// [`Context`], so an `Environment` can be shared between threads and reused.
///
/// # Examples
///
/// ```
/// use nunchucks::{Context, Environment, MemoryLoader, NunchucksInterface};
///
/// let loader: MemoryLoader = [
///     ("base.njk", "<h1>{% block title %}Base{% endblock %}</h1>"),
///     ("page.njk", "{% extends \"base.njk\" %}{% block title %}Hi {{ name }}{% endblock %}"),
/// ]
/// .into_iter()
/// .collect();
/// let env = Environment::new(loader);
///
/// let mut context = Context::new();
/// context.insert("name", "Ada");
///
/// let output = env.render("page.njk", &context).unwrap();
/// assert_eq!(output, "<h1>Hi Ada</h1>");
/// ```
pub struct Environment {
    loader: Box<dyn Loader + Send + Sync>,
    evaluator: ExpressionEvaluator,
    path: PathBuf,
    strip_keywords: Vec<String>,
}

impl Environment {
    /// Creates an environment that reads templates through `loader`.
    ///
    /// # Arguments
    ///
    /// * `loader` - Resolves template names to source text
    pub fn new<L: Loader + Send + Sync + 'static>(loader: L) -> Self {
        Self::configure(ConfigOptions::default().with_loader(loader))
    }

    /// Creates an environment from `options`.
    ///
    /// Without an explicit loader, templates are read from the filesystem
    /// below `options.path` (default `views`).
    ///
    /// # Arguments
    ///
    /// * `options` - Template root, loader and extra strip keywords
    ///
    /// # Returns
    ///
    /// A new environment with the built-in filters and functions.
    pub fn configure(options: ConfigOptions) -> Self {
        let path = options.path.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let loader: Box<dyn Loader + Send + Sync> = match options.loader {
            Some(loader) => loader,
            None => Box::new(FileSystemLoader::new(&path)),
        };
        debug!(loader = loader.type_name(), path = %path.display(), "configured environment");
        Self {
            loader,
            evaluator: ExpressionEvaluator::new(),
            path,
            strip_keywords: options.strip_keywords,
        }
    }

    pub fn loader(&self) -> &dyn Loader {
        self.loader.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a filter usable as `{{ value | name(args) }}`. Custom filters
    /// take precedence over built-in ones of the same name.
    ///
    /// # Example
    ///
    /// ```
    /// use nunchucks::{Context, Environment, MemoryLoader, NunchucksInterface, Value};
    ///
    /// let mut env = Environment::new(MemoryLoader::new());
    /// env.add_filter("shout", |value, _args| Ok(Value::from(format!("{value}!"))));
    ///
    /// let output = env.render_string("{{ 'hey' | shout }}", &Context::new()).unwrap();
    /// assert_eq!(output, "hey!");
    /// ```
    pub fn add_filter<N, F>(&mut self, name: N, filter: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&Value, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.evaluator.add_filter(name, filter);
        self
    }

    /// Registers a function callable as `{{ name(args) }}`.
    pub fn add_function<N, F>(&mut self, name: N, function: F) -> &mut Self
    where
        N: Into<String>,
        F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.evaluator.add_function(name, function);
        self
    }

    fn run(&self, source: &str, context: &Context) -> NunchucksResult<String> {
        let mut ctx = RenderCtx::new(Scope::from(context), &self.evaluator, &self.strip_keywords);
        render_string(source, &mut ctx)
    }

    /// Renders every template file below the configured path into
    /// `out_dir`, keeping relative paths.
    ///
    /// A render whose output is only whitespace removes any previous output
    /// file instead of writing one.
    ///
    /// # Arguments
    ///
    /// * `out_dir` - Destination directory, created if missing
    /// * `context` - Data shared by every render
    ///
    /// # Errors
    ///
    /// * `NunchucksError::InvalidOutputDir` if `out_dir` is blank
    /// * `NunchucksError::Io` if walking, reading or writing fails
    /// * Any error from [`NunchucksInterface::render`]
    pub fn precompile_dir<P: AsRef<Path>>(&self, out_dir: P, context: &Context) -> NunchucksResult<()> {
        let out_dir = out_dir.as_ref();
        if out_dir.as_os_str().to_string_lossy().trim().is_empty() {
            return Err(NunchucksError::InvalidOutputDir {
                message: "output directory is required".to_string(),
            });
        }
        std::fs::create_dir_all(out_dir).map_err(|source| io_error(out_dir, source))?;

        for entry in WalkDir::new(&self.path).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.path).to_path_buf();
                io_error(&path, e.into())
            })?;
            if !entry.file_type().is_file() || !is_template_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.path) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let rendered = self.render(&name, context)?;
            let destination = out_dir.join(relative);
            if rendered.trim().is_empty() {
                trace!(template = %name, "empty output, removing destination");
                match std::fs::remove_file(&destination) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&destination, e)),
                }
                continue;
            }
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
            }
            std::fs::write(&destination, rendered).map_err(|source| io_error(&destination, source))?;
            trace!(template = %name, destination = %destination.display(), "precompiled");
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> NunchucksError {
    NunchucksError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_template_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEMPLATE_EXTENSIONS.iter().any(|t| t.eq_ignore_ascii_case(ext)))
}

impl Default for Environment {
    /// Creates an environment over the `views` directory.
    fn default() -> Self {
        Self::configure(ConfigOptions::default())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("loader", &self.loader.type_name())
            .field("evaluator", &self.evaluator)
            .field("path", &self.path)
            .field("strip_keywords", &self.strip_keywords)
            .finish()
    }
}

impl NunchucksInterface for Environment {
    /// Loads, resolves and renders the template called `template_name`.
    ///
    /// # Arguments
    ///
    /// * `template_name` - The name passed to the loader
    /// * `context` - Variables available to expressions
    ///
    /// # Returns
    ///
    /// * `Ok(String)` containing the rendered output
    /// * `Err(NunchucksError::Load)` if the template or a parent is missing
    /// * `Err(NunchucksError::ExtendsCycle)` if parents form a cycle
    /// * `Err(NunchucksError::Parse)` or `Err(NunchucksError::Eval)` for bad tags or expressions
    ///
    /// # Examples
    ///
    /// ```
    /// use nunchucks::{Context, Environment, MemoryLoader, NunchucksInterface};
    ///
    /// let loader: MemoryLoader = [("list.njk", "{% for x in xs %}[{{ x }}]{% endfor %}")]
    ///     .into_iter()
    ///     .collect();
    /// let env = Environment::new(loader);
    ///
    /// let mut context = Context::new();
    /// context.insert("xs", vec![1, 2]);
    ///
    /// assert_eq!(env.render("list.njk", &context).unwrap(), "[1][2]");
    /// ```
    fn render<N: AsRef<str>>(&self, template_name: N, context: &Context) -> NunchucksResult<String> {
        let name = template_name.as_ref();
        let compiled = self.compile(name)?;
        let output = self.run(&compiled, context)?;
        debug!(template = name, len = output.len(), "rendered");
        Ok(output)
    }

    /// Renders `source` directly. `extends` and `include` are not resolved.
    ///
    /// # Examples
    ///
    /// ```
    /// use nunchucks::{Context, Environment, MemoryLoader, NunchucksInterface};
    ///
    /// let env = Environment::new(MemoryLoader::new());
    /// let output = env
    ///     .render_string("{% set n = 2 %}{{ n * 21 }}", &Context::new())
    ///     .unwrap();
    /// assert_eq!(output, "42");
    /// ```
    fn render_string<S: AsRef<str>>(&self, source: S, context: &Context) -> NunchucksResult<String> {
        self.run(source.as_ref(), context)
    }

    /// Loads `template_name`, resolves `extends` and `include`, and strips
    /// lines that held only structural tags.
    ///
    /// # Returns
    ///
    /// The flattened template source, with control flow and expressions
    /// still in place.
    fn compile<N: AsRef<str>>(&self, template_name: N) -> NunchucksResult<String> {
        let name = template_name.as_ref();
        let source = self.loader.read(name)?;
        let resolved = resolve_extends_and_includes(&source, name, self.loader.as_ref())?;
        let stripped = strip_structural_lines(&resolved, &self.strip_keywords);
        debug!(template = name, len = stripped.len(), "compiled");
        Ok(stripped)
    }
}
