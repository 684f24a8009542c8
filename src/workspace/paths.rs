//! Containment checks for workspace paths

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` components without touching the filesystem
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Canonicalize the longest existing ancestor of `path` and re-attach the
/// rest, so symlinked prefixes compare equal whether or not `path` exists
fn canonicalize_best_effort(path: &Path) -> PathBuf {
    let normalized = normalize_lexically(path);
    for ancestor in normalized.ancestors() {
        if let Ok(canonical) = ancestor.canonicalize() {
            return match normalized.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => canonical.join(rest),
                _ => canonical,
            };
        }
    }
    normalized
}

/// Return the resolved form of `target` if it lies strictly inside `base`.
/// Relative targets are rejected.
pub fn resolve_within(base: &Path, target: &Path) -> Option<PathBuf> {
    if !target.is_absolute() {
        return None;
    }

    let base = canonicalize_best_effort(base);
    let target = canonicalize_best_effort(target);

    if target != base && target.starts_with(&base) {
        Some(target)
    } else {
        None
    }
}

const FORBIDDEN_REF_CHARS: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];

/// Check that `task_id` can be embedded in a directory name and a branch
/// name. Returns the reason it cannot.
pub fn validate_task_id(task_id: &str) -> Result<(), &'static str> {
    if task_id.is_empty() {
        return Err("task id is empty");
    }
    if task_id.contains('/') || task_id.contains('\\') {
        return Err("task id contains a path separator");
    }
    if task_id.contains("..") {
        return Err("task id contains '..'");
    }
    if task_id.chars().any(char::is_whitespace) {
        return Err("task id contains whitespace");
    }
    if task_id.starts_with('-') {
        return Err("task id starts with '-'");
    }
    if task_id.contains(FORBIDDEN_REF_CHARS) {
        return Err("task id contains a character git forbids in branch names");
    }
    Ok(())
}
