//! Read access to the repository checked out by the driver pod.

use std::io;
use std::path::{Path, PathBuf};

/// Files of the checked-out repository, addressed relative to its root
#[cfg_attr(test, mockall::automock)]
pub trait SourceTree: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// Repository checkout on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalSourceTree {
    root: PathBuf,
}

impl LocalSourceTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceTree for LocalSourceTree {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("VERSION"), "1.2.3\n").unwrap();

        let tree = LocalSourceTree::new(dir.path());
        assert_eq!(tree.read_to_string(Path::new("VERSION")).unwrap(), "1.2.3\n");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalSourceTree::new(dir.path());
        let err = tree.read_to_string(Path::new("VERSION")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
