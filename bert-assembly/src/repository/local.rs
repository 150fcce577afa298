use std::path::{Path, PathBuf};

use super::repo::Repo;
use crate::error::BoxedError;

/// Repository in a local directory.
#[derive(Clone, Debug)]
pub struct LocalRepo {
    root: PathBuf,
}

impl LocalRepo {
    /// Create a local repository.
    ///
    /// * `root` - Directory that contains the repository files.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Repo for LocalRepo {
    fn file(&self, path: &Path) -> Result<Option<PathBuf>, BoxedError> {
        let path = self.root.join(path);
        Ok(path.is_file().then_some(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::LocalRepo;
    use crate::repository::Repo;

    #[test]
    fn local_repo_only_finds_existing_files() {
        let root = std::env::temp_dir().join(format!("local-repo-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("config.json"), "{}").unwrap();

        let repo = LocalRepo::new(&root);
        assert!(repo.exists(Path::new("config.json")));
        assert_eq!(
            repo.file(Path::new("config.json")).unwrap(),
            Some(root.join("config.json"))
        );
        assert!(!repo.exists(Path::new("model.safetensors")));
        assert_eq!(repo.file(Path::new("model.safetensors")).unwrap(), None);

        fs::remove_dir_all(&root).unwrap();
    }
}
