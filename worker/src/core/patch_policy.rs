//! Patch safety validation.
//!
//! Validation is pure and all-or-nothing: it inspects parsed file sections
//! against [`PatchConstraints`] and reports every violation it finds. Nothing
//! here touches the filesystem; symlink-aware containment is re-checked by the
//! apply phase.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::diff::FileDiff;
use crate::core::types::ErrorCategory;

/// Limits and denylists a patch must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchConstraints {
    pub max_files: usize,
    pub max_total_lines: u32,
    /// Files whose own diff exceeds this many changed lines produce a warning.
    pub large_file_warning_lines: u32,
    /// Path patterns a patch may never touch. A pattern matches a path exactly,
    /// as a leading directory, as a trailing component, as an embedded
    /// segment, or (with a leading `*`) as a suffix.
    pub denied_paths: Vec<String>,
    /// Extensions (without dot, case-insensitive) treated as binary.
    pub denied_extensions: Vec<String>,
}

impl Default for PatchConstraints {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_total_lines: 1000,
            large_file_warning_lines: 300,
            denied_paths: [
                ".env",
                ".env.local",
                ".env.development",
                ".env.production",
                ".git",
                ".ssh",
                "node_modules",
                "secrets",
                "id_rsa",
                "id_ed25519",
                "*.pem",
                "*.key",
                "package-lock.json",
                "yarn.lock",
                "pnpm-lock.yaml",
                "bun.lockb",
                "Cargo.lock",
                "poetry.lock",
                "Gemfile.lock",
                "composer.lock",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            denied_extensions: [
                "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tar",
                "tgz", "7z", "exe", "dll", "so", "dylib", "bin", "wasm", "woff", "woff2", "ttf",
                "otf", "mp3", "mp4", "mov", "sqlite", "db",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    TooManyFiles,
    TooManyLines,
    PathEscape,
    DeniedPath,
    BinaryExtension,
}

impl IssueKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            IssueKind::TooManyFiles | IssueKind::TooManyLines => ErrorCategory::Analysis,
            IssueKind::PathEscape | IssueKind::DeniedPath | IssueKind::BinaryExtension => {
                ErrorCategory::Environment
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub path: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The most severe category among the errors: environment dominates.
    pub fn category(&self) -> Option<ErrorCategory> {
        let categories: Vec<ErrorCategory> = self.errors.iter().map(|e| e.kind.category()).collect();
        if categories.contains(&ErrorCategory::Environment) {
            Some(ErrorCategory::Environment)
        } else {
            categories.first().copied()
        }
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate parsed file sections against `constraints`.
pub fn validate_patch(
    files: &[FileDiff],
    repo_root: &Path,
    constraints: &PatchConstraints,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if files.len() > constraints.max_files {
        report.errors.push(ValidationIssue {
            kind: IssueKind::TooManyFiles,
            path: None,
            message: format!(
                "patch touches {} files (max {})",
                files.len(),
                constraints.max_files
            ),
        });
    }

    let total: u32 = files.iter().map(|f| f.additions() + f.deletions()).sum();
    if total > constraints.max_total_lines {
        report.errors.push(ValidationIssue {
            kind: IssueKind::TooManyLines,
            path: None,
            message: format!(
                "patch changes {total} lines (max {})",
                constraints.max_total_lines
            ),
        });
    }

    for file in files {
        for path in [file.old_path.as_deref(), file.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            check_path(path, repo_root, constraints, &mut report);
        }

        let changed = file.additions() + file.deletions();
        if changed > constraints.large_file_warning_lines {
            report.warnings.push(format!(
                "{} changes {changed} lines (warning threshold {})",
                file.path(),
                constraints.large_file_warning_lines
            ));
        }
    }

    report.errors.dedup();
    report
}

fn check_path(
    path: &str,
    repo_root: &Path,
    constraints: &PatchConstraints,
    report: &mut ValidationReport,
) {
    let Some(relative) = resolve_within_root(repo_root, Path::new(path)) else {
        report.errors.push(ValidationIssue {
            kind: IssueKind::PathEscape,
            path: Some(path.to_string()),
            message: format!("{path} resolves outside the repository root"),
        });
        return;
    };
    let normalized = to_slash(&relative);

    if let Some(pattern) = constraints
        .denied_paths
        .iter()
        .find(|pattern| denylist_matches(&normalized, pattern))
    {
        report.errors.push(ValidationIssue {
            kind: IssueKind::DeniedPath,
            path: Some(normalized.clone()),
            message: format!("{normalized} matches denylisted pattern '{pattern}'"),
        });
    }

    if let Some(ext) = relative.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        if constraints
            .denied_extensions
            .iter()
            .any(|denied| denied.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            report.errors.push(ValidationIssue {
                kind: IssueKind::BinaryExtension,
                path: Some(normalized.clone()),
                message: format!("{normalized} has binary extension .{ext}"),
            });
        }
    }
}

/// Lexically resolve `path` against `root`.
///
/// Returns the root-relative path, or `None` when the path is absolute outside
/// `root`, climbs above it with `..`, or resolves to the root itself.
pub fn resolve_within_root(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = if path.is_absolute() {
        let root = normalize_lexically(root)?;
        normalize_lexically(path)?.strip_prefix(&root).ok()?.to_path_buf()
    } else {
        path.to_path_buf()
    };

    let mut out = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Match a root-relative, `/`-separated path against one denylist pattern.
pub fn denylist_matches(path: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().trim_matches('/');
    if pattern.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return !suffix.is_empty() && path.ends_with(suffix);
    }
    path == pattern
        || path.starts_with(&format!("{pattern}/"))
        || path.ends_with(&format!("/{pattern}"))
        || path.contains(&format!("/{pattern}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diff::parse_unified_diff;

    fn modify(path: &str, adds: u32) -> String {
        let mut diff = format!("--- a/{path}\n+++ b/{path}\n@@ -1,1 +1,{} @@\n ctx\n", adds + 1);
        for i in 0..adds {
            diff.push_str(&format!("+line {i}\n"));
        }
        diff
    }

    fn validate(diff: &str, constraints: &PatchConstraints) -> ValidationReport {
        let files = parse_unified_diff(diff).expect("parse");
        validate_patch(&files, Path::new("/repo"), constraints)
    }

    #[test]
    fn accepts_ordinary_patch() {
        let report = validate(&modify("src/app.ts", 3), &PatchConstraints::default());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn env_file_is_environment_error_within_limits() {
        let report = validate(&modify(".env", 1), &PatchConstraints::default());
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::DeniedPath);
        assert_eq!(report.category(), Some(ErrorCategory::Environment));
    }

    #[test]
    fn traversal_rejected_even_with_empty_denylist() {
        let constraints = PatchConstraints {
            denied_paths: Vec::new(),
            denied_extensions: Vec::new(),
            ..PatchConstraints::default()
        };
        for path in ["../outside.txt", "src/../../outside.txt", "/etc/passwd"] {
            let diff = format!("--- a/x\n+++ {path}\n@@ -1 +1 @@\n-a\n+b\n");
            let files = parse_unified_diff(&diff).expect("parse");
            let report = validate_patch(&files, Path::new("/repo"), &constraints);
            assert_eq!(report.errors.len(), 1, "{path}");
            assert_eq!(report.errors[0].kind, IssueKind::PathEscape, "{path}");
        }
    }

    #[test]
    fn absolute_path_inside_root_is_relative() {
        assert_eq!(
            resolve_within_root(Path::new("/repo"), Path::new("/repo/src/a.rs")),
            Some(PathBuf::from("src/a.rs"))
        );
        assert_eq!(
            resolve_within_root(Path::new("/repo"), Path::new("src/./b/../a.rs")),
            Some(PathBuf::from("src/a.rs"))
        );
        assert_eq!(resolve_within_root(Path::new("/repo"), Path::new("/repo")), None);
        assert_eq!(
            resolve_within_root(Path::new("/repo"), Path::new("/repository/a")),
            None
        );
    }

    #[test]
    fn limits_are_checked_independently() {
        let constraints = PatchConstraints {
            max_files: 1,
            max_total_lines: 2,
            ..PatchConstraints::default()
        };
        let diff = format!("{}{}", modify("a.txt", 2), modify("b.txt", 2));
        let report = validate(&diff, &constraints);
        let kinds: Vec<IssueKind> = report.errors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![IssueKind::TooManyFiles, IssueKind::TooManyLines]);
        assert_eq!(report.category(), Some(ErrorCategory::Analysis));
    }

    #[test]
    fn binary_extension_rejected_case_insensitive() {
        let report = validate(&modify("assets/Logo.PNG", 1), &PatchConstraints::default());
        assert_eq!(report.errors[0].kind, IssueKind::BinaryExtension);
    }

    #[test]
    fn large_file_warns_without_rejecting() {
        let constraints = PatchConstraints {
            large_file_warning_lines: 5,
            ..PatchConstraints::default()
        };
        let report = validate(&modify("src/big.ts", 6), &constraints);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn validation_is_idempotent() {
        let diff = format!("{}{}", modify(".env", 1), modify("../x", 400));
        let files = parse_unified_diff(&diff).expect("parse");
        let constraints = PatchConstraints::default();
        let first = validate_patch(&files, Path::new("/repo"), &constraints);
        let second = validate_patch(&files, Path::new("/repo"), &constraints);
        assert_eq!(first, second);
    }

    #[test]
    fn denylist_match_forms() {
        assert!(denylist_matches(".env", ".env"));
        assert!(denylist_matches("node_modules/x/index.js", "node_modules"));
        assert!(denylist_matches("app/.env", ".env"));
        assert!(denylist_matches("a/.git/config", ".git"));
        assert!(denylist_matches("certs/server.pem", "*.pem"));
        assert!(!denylist_matches("src/environment.ts", ".env"));
        assert!(!denylist_matches(".envrc", ".env"));
        assert!(!denylist_matches("docs/tokens.md", "*.pem"));
    }
}
