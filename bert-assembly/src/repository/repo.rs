use std::path::{Path, PathBuf};

use crate::error::BoxedError;

/// Represents a repository that contains a model configuration and
/// checkpoint.
pub trait Repo {
    /// Get a repository file.
    ///
    /// * `path` - The path to the file within the repository.
    ///
    /// Returns: The local file path, `None` if the file does not exist.
    fn file(&self, path: &Path) -> Result<Option<PathBuf>, BoxedError>;

    /// Check if the path exists in the repository.
    ///
    /// * `path` - The path to the file within the repository.
    fn exists(&self, path: &Path) -> bool;
}
