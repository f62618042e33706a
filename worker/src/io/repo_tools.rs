//! Read-only repository tools used for context gathering.
//!
//! Nothing here writes to the repository. Any path that resolves outside the
//! root, lexically or through a symlink, is an error rather than an empty
//! result.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::core::patch_policy::resolve_within_root;
use crate::core::types::truncate_chars;

/// Directories never descended into.
const SKIPPED_DIRS: [&str; 4] = [".git", "node_modules", "target", ".worker"];
/// Files larger than this are not searched or opened.
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line: u32,
    pub snippet: String,
    /// Byte ranges of each match within the full line.
    pub matches: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedFile {
    pub path: String,
    pub total_lines: u32,
    /// `start..=end` lines, each prefixed with its line number.
    pub content: String,
    /// The unnumbered text of the returned lines, for symbol extraction.
    #[serde(skip)]
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct RepoTools {
    root: PathBuf,
}

impl RepoTools {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve repository root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Repository-relative files matching `pattern`, sorted, at most `limit`.
    pub fn list_files(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        let matcher = compile_glob(pattern)?;
        let mut files = Vec::new();
        for relative in self.walk() {
            if matcher.is_match(&relative) {
                files.push(relative);
                if files.len() >= limit {
                    break;
                }
            }
        }
        Ok(files)
    }

    /// Case-insensitive literal search for `query` in files matching `file_pattern`.
    pub fn search(
        &self,
        query: &str,
        file_pattern: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            bail!("search query must not be empty");
        }
        let needle = Regex::new(&format!("(?i){}", regex::escape(query)))
            .context("compile search query")?;
        let matcher = compile_glob(file_pattern)?;

        let mut hits = Vec::new();
        for relative in self.walk() {
            if !matcher.is_match(&relative) {
                continue;
            }
            let Some(text) = read_text(&self.root.join(&relative)) else {
                continue;
            };
            for (idx, line) in text.lines().enumerate() {
                let matches: Vec<(usize, usize)> = needle
                    .find_iter(line)
                    .map(|found| (found.start(), found.end()))
                    .collect();
                if matches.is_empty() {
                    continue;
                }
                hits.push(SearchHit {
                    path: relative.clone(),
                    line: idx as u32 + 1,
                    snippet: truncate_chars(line.trim(), SNIPPET_CHARS),
                    matches,
                });
                if hits.len() >= max_results {
                    return Ok(hits);
                }
            }
        }
        Ok(hits)
    }

    /// Open `path`, optionally restricted to the 1-based inclusive `range`.
    pub fn open_file(&self, path: &str, range: Option<(u32, u32)>) -> Result<OpenedFile> {
        let full = self.contained(path)?;
        let meta = fs::metadata(&full).with_context(|| format!("stat {path}"))?;
        if !meta.is_file() {
            bail!("{path} is not a file");
        }
        if meta.len() > MAX_FILE_BYTES {
            bail!("{path} is larger than {MAX_FILE_BYTES} bytes");
        }
        let text = read_text(&full).ok_or_else(|| anyhow!("{path} is not a text file"))?;

        let lines: Vec<&str> = text.lines().collect();
        let total_lines = lines.len() as u32;
        let (start, end) = match range {
            Some((start, end)) => (start.max(1), end.min(total_lines)),
            None => (1, total_lines),
        };
        let width = total_lines.max(1).to_string().len();
        let mut content = String::new();
        let mut raw = String::new();
        if start <= end {
            for (offset, line) in lines[(start - 1) as usize..end as usize].iter().enumerate() {
                let number = start as usize + offset;
                content.push_str(&format!("{number:>width$} | {line}\n"));
                raw.push_str(line);
                raw.push('\n');
            }
        }
        Ok(OpenedFile {
            path: path.to_string(),
            total_lines,
            content,
            raw,
        })
    }

    fn contained(&self, path: &str) -> Result<PathBuf> {
        let relative = resolve_within_root(&self.root, Path::new(path))
            .ok_or_else(|| anyhow!("{path} resolves outside the repository root"))?;
        let full = self.root.join(relative);
        let canonical = full
            .canonicalize()
            .with_context(|| format!("resolve {path}"))?;
        if !canonical.starts_with(&self.root) {
            bail!("{path} resolves outside the repository root through a symlink");
        }
        Ok(canonical)
    }

    /// Repository-relative slash paths of regular files, sorted by name.
    fn walk(&self) -> impl Iterator<Item = String> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_skipped_dir(entry))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&self.root).ok()?;
                Some(
                    relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                )
            })
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Read a file as UTF-8 text, skipping large and binary files.
fn read_text(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    if meta.len() > MAX_FILE_BYTES {
        return None;
    }
    let bytes = fs::read(path).ok()?;
    if bytes.iter().take(8192).any(|&b| b == 0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

/// Compile a repository-relative glob.
///
/// `*` and `?` never cross `/`; `**/` matches zero or more directories.
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("compile glob {pattern}"))?;
    Ok(glob.compile_matcher())
}
