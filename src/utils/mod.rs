//! Identifier validation and traversal-safe path construction.
//!
//! Every place that turns an externally-provided name (agent name, job ID,
//! conversation key) into a filesystem path goes through [`build_safe_path`].
//! The path-traversal class of bugs is eliminated at this single choke point
//! rather than audited call site by call site.

use std::path::{Component, Path, PathBuf};

use crate::error::{FleetError, Result};

pub mod fs;

/// True iff `s` matches `^[A-Za-z0-9][A-Za-z0-9_-]*$`.
///
/// Anything else, including `..`, path separators, NUL, and whitespace,
/// is rejected.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Join identifier-validated `parts` onto `base` and verify the result
/// stays under `base` after normalization.
///
/// The optional `suffix` (e.g. `".json"`) is appended to the final part.
/// Fails with [`FleetError::PathTraversal`] on any invalid part or when the
/// normalized result escapes the base directory.
pub fn build_safe_path(base: &Path, parts: &[&str], suffix: Option<&str>) -> Result<PathBuf> {
    if parts.is_empty() {
        return Err(FleetError::path_traversal("no path components supplied"));
    }

    for part in parts {
        if !is_valid_identifier(part) {
            return Err(FleetError::path_traversal(format!(
                "invalid path component: {:?}",
                part
            )));
        }
    }

    if let Some(sfx) = suffix {
        let mut chars = sfx.chars();
        let dot_then_alnum = chars.next() == Some('.')
            && sfx.len() > 1
            && chars.all(|c| c.is_ascii_alphanumeric());
        if !dot_then_alnum {
            return Err(FleetError::path_traversal(format!(
                "invalid path suffix: {:?}",
                sfx
            )));
        }
    }

    // Canonicalize the base when it exists so symlinked state roots compare
    // correctly; fall back to lexical normalization for not-yet-created dirs.
    let canonical_base = base
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(base));

    let mut path = canonical_base.clone();
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if i == last {
            if let Some(sfx) = suffix {
                path.push(format!("{}{}", part, sfx));
                continue;
            }
        }
        path.push(part);
    }

    let resolved = normalize_lexically(&path);
    if !resolved.starts_with(&canonical_base) {
        return Err(FleetError::path_traversal(format!(
            "resolved path escapes base directory: {}",
            resolved.display()
        )));
    }

    Ok(resolved)
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
