//! On-disk project fixtures.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::pipeline::SessionRequest;
use crate::store::{StateStore, StoreConfig};

/// A temporary project directory with a state store rooted in it.
///
/// The directory is removed when the fixture is dropped.
#[derive(Debug)]
pub struct TestProject {
    dir: TempDir,
    store: Arc<StateStore>,
}

impl TestProject {
    /// Creates a project with the default store layers.
    pub fn new() -> io::Result<Self> {
        Self::with_store_config(|root| StoreConfig::new(root))
    }

    /// Creates a project whose store is configured by `build`.
    pub fn with_store_config(build: impl FnOnce(&Path) -> StoreConfig) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let store = Arc::new(StateStore::new(build(dir.path())));
        Ok(Self { dir, store })
    }

    /// The project directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The project's state store.
    #[must_use]
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// A request for `mode` against this project.
    #[must_use]
    pub fn request(&self, mode: &str) -> SessionRequest {
        SessionRequest::new(self.path(), "test request").with_mode(mode)
    }

    /// A request resuming `session_id`.
    #[must_use]
    pub fn resume(&self, session_id: &str) -> SessionRequest {
        SessionRequest::new(self.path(), "test request").resuming(session_id)
    }

    /// Session record files written so far, sorted.
    pub fn session_files(&self) -> io::Result<Vec<PathBuf>> {
        let dir = self.path().join(".conductor").join("sessions");
        let mut files = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        files.push(path);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_project_store_is_rooted_in_project() {
        let project = TestProject::with_store_config(|root| StoreConfig::direct(root)).unwrap();
        let store = project.store();

        store.write_markdown("notes.md", "# hi").await.unwrap();
        assert!(project.path().join("notes.md").exists());
        assert!(project.session_files().unwrap().is_empty());
    }

    #[test]
    fn test_request_targets_project() {
        let project = TestProject::new().unwrap();
        let request = project.request("import");

        assert_eq!(request.project_dir, project.path());
        assert_eq!(request.mode.as_deref(), Some("import"));
        assert_eq!(project.resume("abc").resume_from.as_deref(), Some("abc"));
    }
}
