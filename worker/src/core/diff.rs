//! Unified diff parsing and hunk application on top of `diffy`.
//!
//! This module splits a diff into per-file sections (git headers, renames,
//! mode lines, `---`/`+++` pairs) and collects each section's hunk bodies.
//! Hunk headers are rebuilt from those bodies before the section is handed to
//! `diffy`, so the wrong length counts and bare blank context lines that
//! generated diffs routinely contain still parse.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{DiffLine, DiffLineKind, FileChange};

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDiffKind {
    Added,
    Modified,
    Deleted,
}

/// One file's section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Pre-image path; `None` when the file is created.
    pub old_path: Option<String>,
    /// Post-image path; `None` when the file is deleted.
    pub new_path: Option<String>,
    pub headers: Vec<String>,
    /// Single-file patch with rebuilt hunk headers, as `diffy` reads it.
    patch: String,
    additions: u32,
    deletions: u32,
}

impl FileDiff {
    /// Target path: the post-image path, or the pre-image path for deletions.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn kind(&self) -> FileDiffKind {
        match (&self.old_path, &self.new_path) {
            (None, _) => FileDiffKind::Added,
            (_, None) => FileDiffKind::Deleted,
            _ => FileDiffKind::Modified,
        }
    }

    pub fn additions(&self) -> u32 {
        self.additions
    }

    pub fn deletions(&self) -> u32 {
        self.deletions
    }

    /// Render the file section as a display-oriented [`FileChange`].
    pub fn to_file_change(&self) -> FileChange {
        let mut lines: Vec<DiffLine> = self
            .headers
            .iter()
            .map(|text| header_line(text))
            .collect();
        if let Ok(patch) = diffy::Patch::from_str(&self.patch) {
            for hunk in patch.hunks() {
                let (old, new) = (hunk.old_range(), hunk.new_range());
                lines.push(header_line(&format!(
                    "@@ -{},{} +{},{} @@",
                    old.start(),
                    old.len(),
                    new.start(),
                    new.len()
                )));
                let mut old_no = old.start() as u32;
                let mut new_no = new.start() as u32;
                for line in hunk.lines() {
                    match line {
                        diffy::Line::Context(text) => {
                            lines.push(DiffLine {
                                kind: DiffLineKind::Context,
                                text: line_text(text),
                                old_line: Some(old_no),
                                new_line: Some(new_no),
                            });
                            old_no += 1;
                            new_no += 1;
                        }
                        diffy::Line::Delete(text) => {
                            lines.push(DiffLine {
                                kind: DiffLineKind::Removed,
                                text: line_text(text),
                                old_line: Some(old_no),
                                new_line: None,
                            });
                            old_no += 1;
                        }
                        diffy::Line::Insert(text) => {
                            lines.push(DiffLine {
                                kind: DiffLineKind::Added,
                                text: line_text(text),
                                old_line: None,
                                new_line: Some(new_no),
                            });
                            new_no += 1;
                        }
                    }
                }
            }
        }
        FileChange {
            path: self.path().to_string(),
            additions: self.additions,
            deletions: self.deletions,
            lines,
        }
    }

    /// Apply this file's hunks to `base`, returning the new content.
    ///
    /// Each hunk lands at its stated line or the nearest exact match of its
    /// pre-image. Content is never fuzzed. Created files apply against `""`.
    pub fn apply_to(&self, base: &str) -> Result<String, HunkError> {
        let patch = diffy::Patch::from_str(&self.patch)
            .map_err(|err| HunkError::Malformed(err.to_string()))?;
        diffy::apply(base, &patch).map_err(|err| HunkError::Drift(err.to_string()))
    }
}

fn line_text(text: &str) -> String {
    text.strip_suffix('\n').unwrap_or(text).to_string()
}

fn header_line(text: &str) -> DiffLine {
    DiffLine {
        kind: DiffLineKind::Header,
        text: text.to_string(),
        old_line: None,
        new_line: None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffParseError {
    Empty,
    HunkOutsideFile { line: usize },
    InvalidHunkHeader { line: usize, header: String },
    MissingPath { line: usize },
    InvalidHunks { path: String, message: String },
}

impl fmt::Display for DiffParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffParseError::Empty => f.write_str("diff contains no file sections"),
            DiffParseError::HunkOutsideFile { line } => {
                write!(f, "hunk at line {line} appears before any file header")
            }
            DiffParseError::InvalidHunkHeader { line, header } => {
                write!(f, "invalid hunk header at line {line}: {header}")
            }
            DiffParseError::MissingPath { line } => {
                write!(f, "file section ending at line {line} names no path")
            }
            DiffParseError::InvalidHunks { path, message } => {
                write!(f, "{path}: invalid hunks: {message}")
            }
        }
    }
}

impl std::error::Error for DiffParseError {}

/// A file section while its lines are still being collected.
#[derive(Debug, Default)]
struct Section {
    old_path: Option<String>,
    new_path: Option<String>,
    headers: Vec<String>,
    hunks: Vec<RawHunk>,
    saw_file_headers: bool,
}

#[derive(Debug)]
struct RawHunk {
    old_start: u32,
    new_start: u32,
    declared_old: u32,
    declared_new: u32,
    old_len: u32,
    new_len: u32,
    /// Body lines with their `' '`/`+`/`-`/`\` prefix.
    body: Vec<String>,
}

impl RawHunk {
    fn is_full(&self) -> bool {
        self.old_len >= self.declared_old && self.new_len >= self.declared_new
    }

    fn push(&mut self, prefix: char, text: &str) {
        match prefix {
            ' ' => {
                self.old_len += 1;
                self.new_len += 1;
            }
            '-' => self.old_len += 1,
            _ => self.new_len += 1,
        }
        self.body.push(format!("{prefix}{text}"));
    }

    fn push_no_newline(&mut self) {
        if self.body.last().is_some_and(|line| !line.starts_with('\\')) {
            self.body.push(NO_NEWLINE_MARKER.to_string());
        }
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            self.old_start, self.old_len, self.new_start, self.new_len
        ));
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
    }
}

/// Parse a unified diff into per-file sections.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>, DiffParseError> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut files = Vec::new();
    let mut current: Option<Section> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish_section(&mut files, current.take(), i)?;
            let (old_path, new_path) = parse_git_header_paths(rest);
            current = Some(Section {
                old_path,
                new_path,
                headers: vec![line.to_string()],
                ..Section::default()
            });
            i += 1;
            continue;
        }

        if is_file_header_pair(&lines, i) {
            let starts_new = current
                .as_ref()
                .is_none_or(|section| section.saw_file_headers || !section.hunks.is_empty());
            if starts_new {
                finish_section(&mut files, current.take(), i)?;
                current = Some(Section::default());
            }
            if let Some(section) = current.as_mut() {
                section.old_path = parse_header_path(&line[4..]);
                section.new_path = parse_header_path(&lines[i + 1][4..]);
                section.saw_file_headers = true;
                section.headers.push(line.to_string());
                section.headers.push(lines[i + 1].to_string());
            }
            i += 2;
            continue;
        }

        if line.starts_with("@@") {
            let Some(section) = current.as_mut() else {
                return Err(DiffParseError::HunkOutsideFile { line: i + 1 });
            };
            let (hunk, next) = collect_hunk(&lines, i)?;
            section.hunks.push(hunk);
            i = next;
            continue;
        }

        if let Some(section) = current.as_mut() {
            if let Some(path) = line.strip_prefix("rename from ") {
                section.old_path = Some(path.trim().to_string());
            } else if let Some(path) = line.strip_prefix("rename to ") {
                section.new_path = Some(path.trim().to_string());
            } else if line.starts_with("new file mode") {
                section.old_path = None;
            } else if line.starts_with("deleted file mode") {
                section.new_path = None;
            }
            if !line.trim().is_empty() {
                section.headers.push(line.to_string());
            }
        }
        i += 1;
    }
    finish_section(&mut files, current.take(), lines.len())?;

    if files.is_empty() {
        return Err(DiffParseError::Empty);
    }
    Ok(files)
}

fn finish_section(
    files: &mut Vec<FileDiff>,
    section: Option<Section>,
    line: usize,
) -> Result<(), DiffParseError> {
    let Some(section) = section else {
        return Ok(());
    };
    let Some(path) = section.new_path.as_ref().or(section.old_path.as_ref()) else {
        return Err(DiffParseError::MissingPath { line });
    };

    let mut patch = String::from("--- original\n+++ modified\n");
    for hunk in &section.hunks {
        hunk.render(&mut patch);
    }
    let (additions, deletions) =
        count_changes(&patch).map_err(|message| DiffParseError::InvalidHunks {
            path: path.clone(),
            message,
        })?;
    files.push(FileDiff {
        old_path: section.old_path,
        new_path: section.new_path,
        headers: section.headers,
        patch,
        additions,
        deletions,
    });
    Ok(())
}

fn count_changes(patch: &str) -> Result<(u32, u32), String> {
    let patch = diffy::Patch::from_str(patch).map_err(|err| err.to_string())?;
    Ok(patch
        .hunks()
        .iter()
        .flat_map(|hunk| hunk.lines())
        .fold((0, 0), |(added, removed), line| match line {
            diffy::Line::Insert(_) => (added + 1, removed),
            diffy::Line::Delete(_) => (added, removed + 1),
            diffy::Line::Context(_) => (added, removed),
        }))
}

fn is_file_header_pair(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "))
}

/// Collect one hunk body starting at the `@@` line `start`. Returns the hunk
/// and the index of the first line after it.
fn collect_hunk(lines: &[&str], start: usize) -> Result<(RawHunk, usize), DiffParseError> {
    let header = lines[start];
    let caps = HUNK_HEADER_RE
        .captures(header)
        .ok_or_else(|| DiffParseError::InvalidHunkHeader {
            line: start + 1,
            header: header.to_string(),
        })?;
    let num = |idx: usize, default: u32| {
        caps.get(idx)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(default)
    };
    let mut hunk = RawHunk {
        old_start: num(1, 0),
        declared_old: num(2, 1),
        new_start: num(3, 0),
        declared_new: num(4, 1),
        old_len: 0,
        new_len: 0,
        body: Vec::new(),
    };

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("@@") || line.starts_with("diff --git ") {
            break;
        }
        // A `---`/`+++` pair is a new file section when the hunk is complete or a
        // hunk header follows it; otherwise it is removed/added content.
        if is_file_header_pair(lines, i)
            && (hunk.is_full() || lines.get(i + 2).is_some_and(|l| l.starts_with("@@")))
        {
            break;
        }
        match line.chars().next() {
            Some(prefix @ (' ' | '+' | '-')) => hunk.push(prefix, &line[1..]),
            Some('\\') => hunk.push_no_newline(),
            // Bare blank lines are context inside the declared span, noise after it.
            None if !hunk.is_full() => hunk.push(' ', ""),
            None => {}
            _ => break,
        }
        i += 1;
    }
    Ok((hunk, i))
}

fn parse_git_header_paths(rest: &str) -> (Option<String>, Option<String>) {
    match rest.rfind(" b/") {
        Some(idx) => (
            parse_header_path(&rest[..idx]),
            parse_header_path(&rest[idx + 1..]),
        ),
        None => {
            let path = parse_header_path(rest);
            (path.clone(), path)
        }
    }
}

fn parse_header_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    let raw = raw.trim_matches('"');
    if raw == "/dev/null" || raw.is_empty() {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(path.to_string())
}

/// Total added plus removed lines across files.
pub fn total_changed_lines(files: &[FileDiff]) -> u32 {
    files
        .iter()
        .map(|file| file.additions() + file.deletions())
        .sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkError {
    /// The stored section no longer parses.
    Malformed(String),
    /// A hunk's pre-image is not present in the base content.
    Drift(String),
}

impl fmt::Display for HunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HunkError::Malformed(message) => write!(f, "patch section does not parse: {message}"),
            HunkError::Drift(message) => write!(f, "{message}: base content has drifted"),
        }
    }
}

impl std::error::Error for HunkError {}
