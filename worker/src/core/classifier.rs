//! Best-effort classification of failure messages.
//!
//! Failing subsystems attach a category where they can (see
//! `orchestrator::RunFailure`); this classifier only covers errors that reach
//! the orchestrator without one.

use crate::core::types::ErrorCategory;

const ENVIRONMENT_MARKERS: &[&str] = &[
    "outside the repository root",
    "path traversal",
    "denylisted",
    "binary extension",
    "permission denied",
];

const VERIFICATION_MARKERS: &[&str] = &[
    "verification",
    "type-check",
    "typecheck",
    "test failed",
    "tests failed",
    "exited with code",
];

const ANALYSIS_MARKERS: &[&str] = &[
    "parse",
    "invalid hunk",
    "diff",
    "proposal",
    "context tools",
    "does not apply",
];

/// Classify an error message by substring match.
///
/// Environment markers win over the others because they signal a
/// non-recoverable condition.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|marker| lower.contains(marker));

    if has(ENVIRONMENT_MARKERS) {
        ErrorCategory::Environment
    } else if has(VERIFICATION_MARKERS) {
        ErrorCategory::Verification
    } else if has(ANALYSIS_MARKERS) {
        ErrorCategory::Analysis
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_environment_messages() {
        assert_eq!(
            classify_message("../x resolves outside the repository root"),
            ErrorCategory::Environment
        );
        assert_eq!(
            classify_message("write src/a.ts: Permission denied (os error 13)"),
            ErrorCategory::Environment
        );
    }

    #[test]
    fn classify_verification_messages() {
        assert_eq!(
            classify_message("npm run test exited with code 1"),
            ErrorCategory::Verification
        );
    }

    #[test]
    fn classify_analysis_messages() {
        assert_eq!(
            classify_message("invalid hunk header at line 3"),
            ErrorCategory::Analysis
        );
    }

    #[test]
    fn environment_wins_over_analysis() {
        assert_eq!(
            classify_message("diff rejected: .env matches denylisted pattern"),
            ErrorCategory::Environment
        );
    }

    #[test]
    fn classify_unmatched_is_unknown() {
        assert_eq!(classify_message("connection reset"), ErrorCategory::Unknown);
    }
}
