//! Deterministic risk scoring for proposed patches.
//!
//! Points are summed from independent contributions and banded into a score.
//! The assessment is advisory: it annotates a patch for human review and never
//! gates application.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::FileChange;

static DESTRUCTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(delete|deletes|deleting|remove|removes|removing|drop|drops|dropping|destroy|wipe|truncate|purge|erase)\b")
        .expect("valid destructive verb regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskScore {
    Low,
    Medium,
    High,
    /// Reserved for external escalation paths; never produced by [`assess_risk`].
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: RiskScore,
    pub points: u32,
    pub factors: Vec<RiskFactor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RiskThresholds {
    /// More files than this contributes 2 points.
    pub many_files: usize,
    /// More changed lines than this contributes 2 points.
    pub large_change_lines: u32,
    /// More changed lines than this contributes a further 4 points.
    pub very_large_change_lines: u32,
    /// Path substrings (case-insensitive) marking critical code.
    pub sensitive_keywords: Vec<String>,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            many_files: 5,
            large_change_lines: 200,
            very_large_change_lines: 500,
            sensitive_keywords: [
                "auth",
                "security",
                "password",
                "secret",
                "token",
                "crypto",
                "payment",
                "billing",
                "migration",
                "permission",
                "credential",
                "session",
                "admin",
                ".env",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Score `files` for the given task description.
pub fn assess_risk(files: &[FileChange], task: &str, thresholds: &RiskThresholds) -> RiskAssessment {
    let mut points = 0u32;
    let mut factors = Vec::new();

    if files.len() > thresholds.many_files {
        points += 2;
        factors.push(RiskFactor {
            reason: format!("touches {} files", files.len()),
            severity: Severity::Medium,
        });
    }

    let changed: u32 = files.iter().map(|f| f.additions + f.deletions).sum();
    if changed > thresholds.large_change_lines {
        points += 2;
        factors.push(RiskFactor {
            reason: format!("large change ({changed} lines)"),
            severity: Severity::Medium,
        });
    }
    if changed > thresholds.very_large_change_lines {
        points += 4;
        factors.push(RiskFactor {
            reason: format!(
                "very large change (over {} lines)",
                thresholds.very_large_change_lines
            ),
            severity: Severity::High,
        });
    }

    let critical: Vec<&str> = files
        .iter()
        .filter(|f| is_sensitive_path(&f.path, &thresholds.sensitive_keywords))
        .map(|f| f.path.as_str())
        .collect();
    if !critical.is_empty() {
        points += 5;
        factors.push(RiskFactor {
            reason: format!("touches critical paths: {}", critical.join(", ")),
            severity: Severity::High,
        });
    }

    if let Some(found) = DESTRUCTIVE_RE.find(task) {
        points += 2;
        factors.push(RiskFactor {
            reason: format!("task uses destructive verb '{}'", found.as_str().to_lowercase()),
            severity: Severity::Medium,
        });
    }

    if factors.is_empty() {
        factors.push(RiskFactor {
            reason: "minor change".to_string(),
            severity: Severity::Low,
        });
    }

    RiskAssessment {
        score: band(points),
        points,
        factors,
    }
}

fn band(points: u32) -> RiskScore {
    match points {
        0..=2 => RiskScore::Low,
        3..=6 => RiskScore::Medium,
        _ => RiskScore::High,
    }
}

fn is_sensitive_path(path: &str, keywords: &[String]) -> bool {
    let lower = path.to_lowercase();
    keywords
        .iter()
        .any(|keyword| !keyword.is_empty() && lower.contains(&keyword.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, additions: u32, deletions: u32) -> FileChange {
        FileChange {
            path: path.to_string(),
            additions,
            deletions,
            lines: Vec::new(),
        }
    }

    #[test]
    fn destructive_task_on_auth_is_high() {
        let files = vec![change("src/auth/login.ts", 40, 5)];
        let risk = assess_risk(&files, "delete the auth module", &RiskThresholds::default());
        assert_eq!(risk.points, 7);
        assert_eq!(risk.score, RiskScore::High);
        assert!(risk.factors[0].reason.contains("src/auth/login.ts"));
        assert!(risk.factors[1].reason.contains("delete"));
    }

    #[test]
    fn small_change_gets_minor_factor() {
        let risk = assess_risk(
            &[change("src/util.ts", 3, 1)],
            "fix typo",
            &RiskThresholds::default(),
        );
        assert_eq!(risk.score, RiskScore::Low);
        assert_eq!(
            risk.factors,
            vec![RiskFactor {
                reason: "minor change".to_string(),
                severity: Severity::Low,
            }]
        );
    }

    #[test]
    fn very_large_change_stacks_both_size_factors() {
        let risk = assess_risk(
            &[change("src/a.ts", 400, 200)],
            "refactor",
            &RiskThresholds::default(),
        );
        assert_eq!(risk.points, 6);
        assert_eq!(risk.score, RiskScore::Medium);
        assert_eq!(risk.factors.len(), 2);
    }

    #[test]
    fn critical_path_counts_once() {
        let files = vec![
            change("src/auth/a.ts", 1, 0),
            change("src/auth/b.ts", 1, 0),
            change("config/secrets.ts", 1, 0),
        ];
        let risk = assess_risk(&files, "update", &RiskThresholds::default());
        assert_eq!(risk.points, 5);
        assert_eq!(risk.score, RiskScore::Medium);
    }

    #[test]
    fn destructive_verb_needs_word_boundary() {
        let risk = assess_risk(
            &[change("src/a.ts", 1, 0)],
            "add dropdown to the removable panel",
            &RiskThresholds::default(),
        );
        assert_eq!(risk.points, 0);
    }

    #[test]
    fn bands() {
        assert_eq!(band(2), RiskScore::Low);
        assert_eq!(band(3), RiskScore::Medium);
        assert_eq!(band(6), RiskScore::Medium);
        assert_eq!(band(7), RiskScore::High);
    }
}
