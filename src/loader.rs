use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use tracing::warn;

use crate::{error::LoadError, interface::Loader};

/// Root used by [`FileSystemLoader`] when none is given.
pub const DEFAULT_ROOT: &str = "views";

/// `MemoryLoader` serves templates from an owned `name -> source` map.
///
/// # Example
///
/// ```rust
/// use nunchucks::{Loader, MemoryLoader};
///
/// let mut loader = MemoryLoader::new();
/// loader.insert("base.njk", "<p>{% block body %}{% endblock %}</p>");
///
/// assert!(loader.read("base.njk").is_ok());
/// assert_eq!(loader.read("nope.njk").unwrap_err().reason, "No file found: nope.njk");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLoader {
    files: IndexMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the template called `name`.
    pub fn insert<N: Into<String>, S: Into<String>>(&mut self, name: N, source: S) -> &mut Self {
        self.files.insert(name.into(), source.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<N: Into<String>, S: Into<String>> FromIterator<(N, S)> for MemoryLoader {
    fn from_iter<T: IntoIterator<Item = (N, S)>>(iter: T) -> Self {
        Self {
            files: iter
                .into_iter()
                .map(|(name, source)| (name.into(), source.into()))
                .collect(),
        }
    }
}

impl Loader for MemoryLoader {
    fn type_name(&self) -> &'static str {
        "memory"
    }

    fn read(&self, name: &str) -> Result<String, LoadError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::not_found(name, name))
    }
}

/// `FileSystemLoader` reads templates from files below a root directory.
///
/// Names are paths relative to the root. A name that is absolute or climbs
/// out of the root with `..` is treated as missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    /// Creates a loader rooted at `root`, or at [`DEFAULT_ROOT`] when `root`
    /// is blank.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let root = if root.as_os_str().to_string_lossy().trim().is_empty() {
            Path::new(DEFAULT_ROOT)
        } else {
            root
        };
        Self {
            root: std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `name` below the root, or `None` if it would leave it.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
        if escapes || name.trim().is_empty() {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Default for FileSystemLoader {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl Loader for FileSystemLoader {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn read(&self, name: &str) -> Result<String, LoadError> {
        let Some(path) = self.resolve(name).filter(|p| p.is_file()) else {
            let shown = self.root.join(name);
            let error = LoadError::not_found(name, &shown.display().to_string());
            warn!(loader = self.type_name(), "{}", error.reason);
            return Err(error);
        };

        std::fs::read_to_string(&path).map_err(|e| {
            warn!(loader = self.type_name(), path = %path.display(), "{e}");
            LoadError {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_memory_loader_reads_and_reports_missing() {
        let loader: MemoryLoader = [("a.njk", "A")].into_iter().collect();
        assert_eq!(loader.type_name(), "memory");
        assert_eq!(loader.read("a.njk").unwrap(), "A");

        let err = loader.read("b.njk").unwrap_err();
        assert_eq!(err.name, "b.njk");
        assert_eq!(err.reason, "No file found: b.njk");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_memory_loader_insert_replaces() {
        let mut loader = MemoryLoader::new();
        loader.insert("a", "1").insert("a", "2");
        assert_eq!(loader.len(), 1);
        assert_eq!(loader.read("a").unwrap(), "2");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blank_root_defaults_to_views() {
        let loader = FileSystemLoader::new("  ");
        assert!(loader.root().ends_with(DEFAULT_ROOT));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_names_escaping_the_root_are_rejected() {
        let loader = FileSystemLoader::new("views");
        assert!(loader.resolve("../secret.txt").is_none());
        assert!(loader.resolve("a/../../secret.txt").is_none());
        assert!(loader.resolve("/etc/passwd").is_none());
        assert!(loader.resolve("").is_none());
        assert!(loader.resolve("pages/index.njk").is_some());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn test_file_system_loader_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("partials")).unwrap();
        std::fs::write(dir.path().join("partials/nav.njk"), "<nav>").unwrap();

        let loader = FileSystemLoader::new(dir.path());
        assert_eq!(loader.read("partials/nav.njk").unwrap(), "<nav>");

        let err = loader.read("missing.njk").unwrap_err();
        assert_eq!(err.name, "missing.njk");
        assert!(err.reason.starts_with("No file found: "));
        assert!(err.reason.ends_with("missing.njk"));

        // A directory is not a template.
        assert!(loader.read("partials").is_err());
    }
}
