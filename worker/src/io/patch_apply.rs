//! Applying validated diffs to the working tree.
//!
//! Apply is a separate contract from validation: callers re-validate first,
//! and this module still re-checks containment against symlinks before each
//! write. Files are handled independently, so one drifted file does not stop
//! the others from being reported.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::diff::{FileDiff, FileDiffKind};
use crate::core::patch_policy::resolve_within_root;
use crate::io::config::write_atomic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub files_affected: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Apply every file section under `repo_root`.
#[instrument(skip_all, fields(repo_root = %repo_root.display(), files = files.len()))]
pub fn apply_patch(repo_root: &Path, files: &[FileDiff]) -> ApplyReport {
    let mut report = ApplyReport::default();
    let root = match repo_root.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            report
                .errors
                .push(format!("repository root {}: {err}", repo_root.display()));
            return report;
        }
    };

    for file in files {
        let path = file.path().to_string();
        match apply_file(&root, file, &mut report.warnings) {
            Ok(true) => report.files_affected.push(path),
            Ok(false) => {}
            Err(message) => {
                warn!(path = %path, error = %message, "file did not apply");
                report.errors.push(message);
            }
        }
    }
    report
}

/// Returns whether the file was written.
fn apply_file(root: &Path, file: &FileDiff, warnings: &mut Vec<String>) -> Result<bool, String> {
    let path = file.path();
    match file.kind() {
        FileDiffKind::Deleted => {
            warnings.push(format!(
                "{path}: deletion not applied; remove the file manually if intended"
            ));
            Ok(false)
        }
        FileDiffKind::Added => {
            let target = contained_target(root, path)?;
            if target.exists() {
                warnings.push(format!("{path}: created file already existed and was replaced"));
            }
            let contents = file.apply_to("").map_err(|err| format!("{path}: {err}"))?;
            write_file(&target, path, contents.as_bytes())?;
            Ok(true)
        }
        FileDiffKind::Modified => {
            let source_path = file.old_path.as_deref().unwrap_or(path);
            let source = contained_target(root, source_path)?;
            let original = fs::read_to_string(&source)
                .map_err(|err| format!("{source_path}: read failed: {err}"))?;
            let updated = file
                .apply_to(&original)
                .map_err(|err| format!("{path}: {err}"))?;
            let target = contained_target(root, path)?;
            write_file(&target, path, updated.as_bytes())?;
            if source_path != path {
                warnings.push(format!(
                    "{source_path}: renamed to {path}; the old path was left in place"
                ));
            }
            Ok(true)
        }
    }
}

fn write_file(target: &Path, display_path: &str, contents: &[u8]) -> Result<(), String> {
    debug!(path = %display_path, bytes = contents.len(), "writing file");
    write_atomic(target, contents).map_err(|err| format!("{display_path}: write failed: {err:#}"))
}

/// Resolve `path` under `root`, following any symlinks that already exist.
fn contained_target(root: &Path, path: &str) -> Result<PathBuf, String> {
    let relative = resolve_within_root(root, Path::new(path))
        .ok_or_else(|| format!("{path} resolves outside the repository root"))?;
    let target = root.join(&relative);

    // Canonicalize the deepest existing ancestor; missing components cannot
    // be symlinks yet.
    let mut existing = target.as_path();
    let canonical = loop {
        match existing.canonicalize() {
            Ok(canonical) => break canonical,
            Err(_) => match existing.parent() {
                Some(parent) => existing = parent,
                None => return Err(format!("{path}: no existing ancestor")),
            },
        }
    };
    if !canonical.starts_with(root) {
        return Err(format!(
            "{path} resolves outside the repository root through a symlink"
        ));
    }
    Ok(target)
}
