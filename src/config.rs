use std::{fmt, path::PathBuf};

use crate::interface::Loader;

/// Options accepted by [`crate::Environment::configure`].
///
/// # Example
///
/// ```rust
/// use nunchucks::{ConfigOptions, Environment, MemoryLoader, NunchucksInterface};
///
/// let loader: MemoryLoader = [("page.njk", "hi")].into_iter().collect();
/// let env = Environment::configure(
///     ConfigOptions::default()
///         .with_loader(loader)
///         .with_strip_keywords(["client"]),
/// );
/// assert_eq!(env.compile("page.njk").unwrap(), "hi");
/// ```
#[derive(Default)]
pub struct ConfigOptions {
    /// Template root. Backs the default filesystem loader and is the tree
    /// walked by [`crate::Environment::precompile_dir`].
    pub path: Option<PathBuf>,
    /// Replaces the filesystem loader.
    pub loader: Option<Box<dyn Loader + Send + Sync>>,
    /// Statement keywords stripped like the structural ones.
    pub strip_keywords: Vec<String>,
}

impl ConfigOptions {
    #[must_use]
    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_loader<L: Loader + Send + Sync + 'static>(mut self, loader: L) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    #[must_use]
    pub fn with_strip_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strip_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for ConfigOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOptions")
            .field("path", &self.path)
            .field("loader", &self.loader.as_ref().map(|l| l.type_name()))
            .field("strip_keywords", &self.strip_keywords)
            .finish()
    }
}
