// ABOUTME: Per-run scratch directories materialized from a template tree plus generated files
// ABOUTME: Rejects path escapes and symlink components; deletion is recursive and idempotent

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("unsafe path in generated output: {0}")]
    UnsafePath(String),

    #[error("workspace io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Manages run workspaces under a configured base directory. Each run gets
/// `<base>/<run_id>`, seeded from the deployer-supplied template tree and
/// overlaid with the generated files (overlay wins on conflict).
pub struct WorkspaceManager {
    base: PathBuf,
    template: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>, template: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            template: template.into(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.base.join(run_id)
    }

    /// Create the workspace for a run: template tree first, then the
    /// generated files on top.
    pub fn materialize(&self, run_id: &str, files: &HashMap<String, String>) -> Result<PathBuf> {
        let root = self.path_for(run_id);
        fs::create_dir_all(&root)?;

        if self.template.is_dir() {
            copy_tree(&self.template, &root)?;
        } else {
            warn!(
                "template dir {} missing, materializing workspace from generated files only",
                self.template.display()
            );
        }

        for (rel, content) in files {
            let target = safe_join(&root, rel)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
        }

        debug!("materialized workspace {} ({} files)", root.display(), files.len());
        Ok(root)
    }

    /// Delete a run's workspace. Removing a missing workspace is a no-op.
    pub fn remove(&self, run_id: &str) -> Result<()> {
        let root = self.path_for(run_id);
        match fs::remove_dir_all(&root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.path_for(run_id).is_dir()
    }
}

/// Resolve `rel` under `root`, refusing absolute paths, `..` components, and
/// any component that resolves through a symlink.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() || rel.starts_with('/') || rel.starts_with('\\') {
        return Err(WorkspaceError::UnsafePath(rel.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                // A symlink anywhere along the path could point outside the root.
                if let Ok(meta) = fs::symlink_metadata(&resolved) {
                    if meta.file_type().is_symlink() {
                        return Err(WorkspaceError::UnsafePath(rel.to_string()));
                    }
                }
            }
            Component::CurDir => {}
            _ => return Err(WorkspaceError::UnsafePath(rel.to_string())),
        }
    }
    Ok(resolved)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (WorkspaceManager, TempDir, TempDir) {
        let base = TempDir::new().unwrap();
        let template = TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path(), template.path());
        (mgr, base, template)
    }

    #[test]
    fn test_materialize_overlays_template() {
        let (mgr, _base, template) = manager();
        fs::write(template.path().join("package.json"), "{\"name\":\"scaffold\"}").unwrap();
        fs::create_dir_all(template.path().join("app")).unwrap();
        fs::write(template.path().join("app/layout.tsx"), "layout").unwrap();

        let mut files = HashMap::new();
        files.insert("app/page.tsx".to_string(), "generated page".to_string());
        files.insert("package.json".to_string(), "{\"name\":\"generated\"}".to_string());

        let root = mgr.materialize("run1", &files).unwrap();
        assert_eq!(
            fs::read_to_string(root.join("app/layout.tsx")).unwrap(),
            "layout"
        );
        assert_eq!(
            fs::read_to_string(root.join("app/page.tsx")).unwrap(),
            "generated page"
        );
        // Overlay wins over the template copy.
        assert_eq!(
            fs::read_to_string(root.join("package.json")).unwrap(),
            "{\"name\":\"generated\"}"
        );
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let (mgr, _base, _template) = manager();
        let mut files = HashMap::new();
        files.insert("../escape.txt".to_string(), "x".to_string());
        assert!(matches!(
            mgr.materialize("run1", &files),
            Err(WorkspaceError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_rejects_absolute_path() {
        let (mgr, _base, _template) = manager();
        let mut files = HashMap::new();
        files.insert("/etc/passwd".to_string(), "x".to_string());
        assert!(matches!(
            mgr.materialize("run1", &files),
            Err(WorkspaceError::UnsafePath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_component() {
        let (mgr, base, _template) = manager();
        let root = base.path().join("run1");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink("/tmp", root.join("link")).unwrap();

        let mut files = HashMap::new();
        files.insert("link/evil.txt".to_string(), "x".to_string());
        assert!(matches!(
            mgr.materialize("run1", &files),
            Err(WorkspaceError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent_and_leaves_no_trace() {
        let (mgr, base, _template) = manager();
        let files = HashMap::from([("index.html".to_string(), "hi".to_string())]);
        mgr.materialize("run1", &files).unwrap();
        assert!(mgr.exists("run1"));

        mgr.remove("run1").unwrap();
        assert!(!mgr.exists("run1"));
        mgr.remove("run1").unwrap();

        let leftovers: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
