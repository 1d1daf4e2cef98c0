//! Workdir jail: path-taking tools resolve every input against an allow-list
//! root, with symlinks resolved before the containment check.

use std::path::{Path, PathBuf};

use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// The root itself is canonicalized once so later prefix checks compare
    /// like with like.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `input` (absolute or jail-relative) to a canonical path inside
    /// the jail. Symlinks pointing outside are rejected. The path's parent
    /// must exist; the final component may not (so tools can create files).
    pub fn resolve(&self, input: impl AsRef<Path>) -> Result<PathBuf> {
        let input = input.as_ref();
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };

        let resolved = match joined.canonicalize() {
            Ok(p) => p,
            Err(_) => {
                // target may not exist yet: canonicalize the parent and
                // re-attach the final component
                let parent = joined
                    .parent()
                    .ok_or_else(|| SupervisorError::JailEscape {
                        path: input.display().to_string(),
                    })?;
                let name = joined.file_name().ok_or_else(|| SupervisorError::JailEscape {
                    path: input.display().to_string(),
                })?;
                parent.canonicalize()?.join(name)
            }
        };

        if !resolved.starts_with(&self.root) {
            return Err(SupervisorError::JailEscape {
                path: input.display().to_string(),
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_stay_inside() {
        let dir = tempfile::tempdir().unwrap();
        let jail = Jail::new(dir.path()).unwrap();
        let resolved = jail.resolve("notes/todo.txt").unwrap_err();
        // parent "notes" does not exist yet
        assert!(matches!(resolved, SupervisorError::Io(_)));

        std::fs::create_dir(dir.path().join("notes")).unwrap();
        let resolved = jail.resolve("notes/todo.txt").unwrap();
        assert!(resolved.starts_with(jail.root()));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let jail = Jail::new(dir.path()).unwrap();
        assert!(matches!(
            jail.resolve("../outside.txt"),
            Err(SupervisorError::JailEscape { .. })
        ));
    }

    #[test]
    fn absolute_outside_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let jail = Jail::new(dir.path()).unwrap();
        assert!(matches!(
            jail.resolve("/etc/passwd"),
            Err(SupervisorError::JailEscape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("sneaky");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let jail = Jail::new(dir.path()).unwrap();
        assert!(matches!(
            jail.resolve("sneaky/file.txt"),
            Err(SupervisorError::JailEscape { .. })
        ));
    }
}
