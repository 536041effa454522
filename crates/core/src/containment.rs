#![forbid(unsafe_code)]

use std::path::{Component, Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContainmentError {
    #[error("declared path is empty")]
    Empty,
    #[error("job directory cannot be resolved: {0}")]
    RootUnavailable(String),
    #[error("declared path escapes the job directory: {0}")]
    Escapes(String),
    #[error("declared path resolves to the job directory itself: {0}")]
    IsRoot(String),
    #[error("declared path does not exist: {0}")]
    Missing(String),
}

/// Resolves `declared` against `root` and returns its canonical form, which is
/// always a strict descendant of the canonical `root`.
///
/// Relative paths are checked lexically first (`..` may never climb above the
/// root), then the existing file is canonicalized so a symlink cannot point
/// the approved path elsewhere.
pub fn resolve_contained(root: &Path, declared: &str) -> Result<PathBuf, ContainmentError> {
    let declared = declared.trim();
    if declared.is_empty() {
        return Err(ContainmentError::Empty);
    }
    let root = root
        .canonicalize()
        .map_err(|err| ContainmentError::RootUnavailable(format!("{}: {err}", root.display())))?;

    let declared_path = Path::new(declared);
    let candidate = if declared_path.is_absolute() {
        match declared_path.canonicalize() {
            Ok(resolved) => resolved,
            Err(_) => {
                let lexical = normalize_absolute(declared_path);
                if !lexical.starts_with(&root) {
                    return Err(ContainmentError::Escapes(declared.to_string()));
                }
                return Err(ContainmentError::Missing(declared.to_string()));
            }
        }
    } else {
        let relative = normalize_relative(declared_path)
            .ok_or_else(|| ContainmentError::Escapes(declared.to_string()))?;
        if relative.as_os_str().is_empty() {
            return Err(ContainmentError::IsRoot(declared.to_string()));
        }
        let joined = root.join(relative);
        if std::fs::symlink_metadata(&joined).is_err() {
            return Err(ContainmentError::Missing(declared.to_string()));
        }
        joined
            .canonicalize()
            .map_err(|_| ContainmentError::Missing(declared.to_string()))?
    };

    if candidate == root {
        return Err(ContainmentError::IsRoot(declared.to_string()));
    }
    if !candidate.starts_with(&root) {
        return Err(ContainmentError::Escapes(declared.to_string()));
    }
    Ok(candidate)
}

/// `None` when a `..` would climb above the starting point.
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn normalize_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(test_name: &str) -> PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "jv_core_{test_name}_{}_{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn approves_existing_descendant() {
        let base = temp_dir("approves_existing_descendant");
        let root = base.join("JOB-1");
        std::fs::create_dir_all(root.join("out")).expect("mkdir");
        std::fs::write(root.join("out/report.csv"), "a,b\n").expect("write");

        let approved = resolve_contained(&root, "out/./report.csv").expect("contained");
        let canonical_root = root.canonicalize().expect("canonical root");
        assert!(approved.starts_with(&canonical_root));
        assert_ne!(approved, canonical_root);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn parent_dir_escape_is_rejected_even_if_target_exists() {
        let base = temp_dir("parent_dir_escape");
        let root = base.join("JOB-1");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(base.join("secret.txt"), "x").expect("write");

        assert_eq!(
            resolve_contained(&root, "../secret.txt"),
            Err(ContainmentError::Escapes("../secret.txt".to_string()))
        );
        assert_eq!(
            resolve_contained(&root, "a/../../secret.txt"),
            Err(ContainmentError::Escapes("a/../../secret.txt".to_string()))
        );

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let base = temp_dir("absolute_outside");
        let root = base.join("JOB-1");
        std::fs::create_dir_all(&root).expect("mkdir");
        let outside = base.join("elsewhere.txt");
        std::fs::write(&outside, "x").expect("write");

        let declared = outside.to_string_lossy().to_string();
        assert_eq!(
            resolve_contained(&root, &declared),
            Err(ContainmentError::Escapes(declared.clone()))
        );

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn root_itself_and_missing_files_are_not_approved() {
        let base = temp_dir("root_and_missing");
        let root = base.join("JOB-1");
        std::fs::create_dir_all(&root).expect("mkdir");

        assert_eq!(
            resolve_contained(&root, "."),
            Err(ContainmentError::IsRoot(".".to_string()))
        );
        assert_eq!(
            resolve_contained(&root, "nope.txt"),
            Err(ContainmentError::Missing("nope.txt".to_string()))
        );
        assert_eq!(resolve_contained(&root, "  "), Err(ContainmentError::Empty));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_is_rejected() {
        let base = temp_dir("symlink_outside");
        let root = base.join("JOB-1");
        std::fs::create_dir_all(&root).expect("mkdir");
        std::fs::write(base.join("target.txt"), "x").expect("write");
        std::os::unix::fs::symlink(base.join("target.txt"), root.join("link.txt"))
            .expect("symlink");

        assert_eq!(
            resolve_contained(&root, "link.txt"),
            Err(ContainmentError::Escapes("link.txt".to_string()))
        );

        let _ = std::fs::remove_dir_all(&base);
    }
}
