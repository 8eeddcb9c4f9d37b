//! Repository file discovery for the indexer.
//!
//! Walks the repository, prunes excluded directories (plus anything listed
//! in a root-level `.agentignore`), accepts files on a text-extension
//! allowlist, and rejects oversized files and lock/artifact files. The
//! resulting list is sorted for deterministic indexing order.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Files larger than this are skipped with reason `too_large`.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    "node_modules",
    ".venv",
    "venv",
    ".env",
    ".idea",
    ".vscode",
    "dist",
    "build",
    "target",
    ".tox",
    ".rag_db",
    ".rag_logs",
    "artifacts",
    "logs",
    "media",
    "assets",
    "temp",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "md", "txt", "rst", "yml", "yaml", "json", "xml", "html",
    "css", "sql", "sh", "bat", "ps1", "cfg", "ini", "toml", "java", "c", "cpp", "h", "hpp", "cs",
    "go", "rs", "php", "rb", "swift", "kt", "scala", "r", "m", "pl", "lua",
];

const EXCLUDE_FILES: &[&str] = &[
    "artifact.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Cargo.lock",
    "Gemfile.lock",
    "composer.lock",
];

/// Well-known text files without an extension.
const KNOWN_TEXT_NAMES: &[&str] = &["readme", "license", "changelog", "dockerfile", "makefile"];

/// Why a candidate file was rejected during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// File exceeds [`MAX_FILE_SIZE`]
    TooLarge,
}

impl SkipReason {
    /// Stable label used in the index report.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            SkipReason::TooLarge => "too_large",
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Extra directory names to prune
    pub exclude_dirs: Vec<String>,
    /// File-name glob patterns to require (empty = accept all)
    pub include_patterns: Vec<String>,
}

/// Result of a discovery walk.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Accepted files, sorted by path
    pub files: Vec<PathBuf>,
    /// Rejected files with a reportable reason
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

/// Read directory names out of a root-level `.agentignore`.
///
/// Lines starting with `#` and blank lines are ignored.
#[must_use]
pub fn agent_ignore_entries(repo_root: &Path) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(repo_root.join(".agentignore")) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.trim_end_matches('/').to_string())
        .collect()
}

/// Walk `repo_root` and produce the accepted file list.
#[must_use]
pub fn discover_files(repo_root: &Path, options: &WalkOptions) -> WalkOutcome {
    let mut exclude: BTreeSet<String> = DEFAULT_EXCLUDE_DIRS
        .iter()
        .map(|d| (*d).to_string())
        .collect();
    exclude.extend(options.exclude_dirs.iter().cloned());
    exclude.extend(agent_ignore_entries(repo_root));

    let mut outcome = WalkOutcome::default();

    let walker = WalkDir::new(repo_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !exclude.contains(name.as_ref())
        });

    for entry in walker.filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();

        if EXCLUDE_FILES.iter().any(|excluded| *excluded == name) {
            continue;
        }
        if !options.include_patterns.is_empty()
            && !options
                .include_patterns
                .iter()
                .any(|pattern| matches_pattern(&name, pattern))
        {
            continue;
        }
        if !is_text_file(path) {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) if metadata.len() > MAX_FILE_SIZE => {
                outcome.skipped.push((path.to_path_buf(), SkipReason::TooLarge));
                continue;
            }
            Ok(_) => {}
            Err(_) => continue,
        }
        outcome.files.push(path.to_path_buf());
    }

    outcome
        .files
        .sort_by_key(|path| path.to_string_lossy().to_lowercase());
    outcome
}

/// A file is text when its extension is allowlisted, its name is a known
/// text file, or it starts with a shebang.
fn is_text_file(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
        return false;
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if KNOWN_TEXT_NAMES.contains(&name.as_str()) {
        return true;
    }

    // Extensionless scripts announce themselves with a shebang.
    let mut prefix = [0u8; 2];
    match fs::File::open(path).and_then(|mut f| {
        use std::io::Read;
        f.read_exact(&mut prefix)?;
        Ok(prefix)
    }) {
        Ok(prefix) => &prefix == b"#!",
        Err(_) => false,
    }
}

/// Minimal `*`-wildcard matcher for include patterns like `*.rs`.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    fn inner(name: &[u8], pattern: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                inner(name, &pattern[1..])
                    || (!name.is_empty() && inner(&name[1..], pattern))
            }
            (Some(p), Some(n)) if p == n => inner(&name[1..], &pattern[1..]),
            _ => false,
        }
    }
    inner(name.as_bytes(), pattern.as_bytes())
}
