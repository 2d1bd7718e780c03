//! Filesystem operations on the host
//!
//! Used directly by the local backend and by the in-sandbox server, which
//! makes the two execution paths agree on every edge case.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use regex::Regex;
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use super::{BackendError, FileEntry, Filesystem, FsError, GrepMatch, SearchResult};

/// Directory names never descended into by glob and grep
pub const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
];

/// Files larger than this are not searched by grep
const MAX_GREP_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Matched lines longer than this are cut
const MAX_LINE_CHARS: usize = 500;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct HostFilesystem {
    root: PathBuf,
    max_results: usize,
}

impl HostFilesystem {
    /// # Arguments
    /// * `root` - Directory relative paths resolve against
    /// * `max_results` - Bound on glob and grep matches
    pub fn new(root: impl Into<PathBuf>, max_results: usize) -> Self {
        Self {
            root: root.into(),
            max_results: max_results.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if path.is_empty() {
            self.root.clone()
        } else if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn ls_sync(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        let dir = self.resolve(path);
        let read = fs::read_dir(&dir).map_err(|e| FsError::from_io(path, e))?;
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().map_err(|e| FsError::from_io(path, e))?;
            entries.push(FileEntry {
                path: display_join(path, Path::new(&name)),
                name,
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read_sync(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, FsError> {
        let file = self.resolve(path);
        if file.is_dir() {
            return Err(FsError::InvalidInput(format!("{} is a directory", path)));
        }
        let bytes = fs::read(&file).map_err(|e| FsError::from_io(path, e))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| FsError::InvalidInput(format!("{} is not a UTF-8 text file", path)))?;

        if offset.is_none() && limit.is_none() {
            return Ok(content);
        }
        let lines = content
            .lines()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX));
        Ok(lines.collect::<Vec<_>>().join("\n"))
    }

    pub fn write_sync(&self, path: &str, content: &str) -> Result<(), FsError> {
        let file = self.resolve(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::from_io(path, e))?;
        }
        atomic_write(&file, content.as_bytes()).map_err(|e| FsError::from_io(path, e))
    }

    pub fn edit_sync(&self, path: &str, old_text: &str, new_text: &str) -> Result<(), FsError> {
        if old_text.is_empty() {
            return Err(FsError::InvalidInput("old_text must not be empty".into()));
        }
        let content = self.read_sync(path, None, None)?;
        if !content.contains(old_text) {
            return Err(FsError::EditTextNotFound(path.to_string()));
        }
        let updated = content.replacen(old_text, new_text, 1);
        atomic_write(&self.resolve(path), updated.as_bytes()).map_err(|e| FsError::from_io(path, e))
    }

    pub fn glob_sync(&self, pattern: &str, path: Option<&str>) -> Result<SearchResult<String>, FsError> {
        let matcher = Pattern::new(pattern).map_err(|e| FsError::Pattern(e.to_string()))?;
        let base_arg = path.unwrap_or("");
        let base = self.resolve(base_arg);
        if !base.exists() {
            return Err(FsError::NotFound(base_arg.to_string()));
        }

        let mut matches = Vec::new();
        let mut truncated = false;
        for entry in walk(&base) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            if matcher.matches_path_with(rel, MATCH_OPTIONS) {
                matches.push(display_join(base_arg, rel));
                if matches.len() >= self.max_results {
                    truncated = true;
                    break;
                }
            }
        }
        Ok(SearchResult { matches, truncated })
    }

    pub fn grep_sync(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<SearchResult<GrepMatch>, FsError> {
        let regex = Regex::new(pattern).map_err(|e| FsError::Pattern(e.to_string()))?;
        let filter = glob
            .map(|g| Pattern::new(g).map_err(|e| FsError::Pattern(e.to_string())))
            .transpose()?;
        let base_arg = path.unwrap_or("");
        let base = self.resolve(base_arg);
        if !base.exists() {
            return Err(FsError::NotFound(base_arg.to_string()));
        }

        let mut matches = Vec::new();
        for entry in walk(&base) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            if let Some(filter) = &filter {
                let name = entry.file_name().to_string_lossy();
                if !filter.matches_path_with(rel, MATCH_OPTIONS) && !filter.matches(&name) {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len() > MAX_GREP_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            // Binary and unreadable files are skipped
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let shown = if rel.as_os_str().is_empty() {
                base_arg.to_string()
            } else {
                display_join(base_arg, rel)
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(GrepMatch {
                        path: shown.clone(),
                        line: idx + 1,
                        text: clip(line),
                    });
                    if matches.len() >= self.max_results {
                        return Ok(SearchResult {
                            matches,
                            truncated: true,
                        });
                    }
                }
            }
        }
        Ok(SearchResult {
            matches,
            truncated: false,
        })
    }
}

#[async_trait]
impl Filesystem for HostFilesystem {
    async fn ls(&self, path: &str) -> Result<Vec<FileEntry>, BackendError> {
        let this = self.clone();
        let path = path.to_string();
        blocking(move || this.ls_sync(&path)).await
    }

    async fn read(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, BackendError> {
        let this = self.clone();
        let path = path.to_string();
        blocking(move || this.read_sync(&path, offset, limit)).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let this = self.clone();
        let (path, content) = (path.to_string(), content.to_string());
        blocking(move || this.write_sync(&path, &content)).await
    }

    async fn edit(&self, path: &str, old_text: &str, new_text: &str) -> Result<(), BackendError> {
        let this = self.clone();
        let (path, old_text, new_text) = (path.to_string(), old_text.to_string(), new_text.to_string());
        blocking(move || this.edit_sync(&path, &old_text, &new_text)).await
    }

    async fn glob(&self, pattern: &str, path: Option<&str>) -> Result<SearchResult<String>, BackendError> {
        let this = self.clone();
        let pattern = pattern.to_string();
        let path = path.map(str::to_string);
        blocking(move || this.glob_sync(&pattern, path.as_deref())).await
    }

    async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<SearchResult<GrepMatch>, BackendError> {
        let this = self.clone();
        let pattern = pattern.to_string();
        let path = path.map(str::to_string);
        let glob = glob.map(str::to_string);
        blocking(move || this.grep_sync(&pattern, path.as_deref(), glob.as_deref())).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FsError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Fs(FsError::Io(format!("filesystem task failed: {}", e))))?
        .map_err(BackendError::from)
}

/// Write through a temp file in the same directory, then rename over the target
pub fn atomic_write(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        if let Ok(metadata) = fs::metadata(target) {
            fs::set_permissions(&tmp, metadata.permissions())?;
        }
        fs::rename(&tmp, target)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Depth-first walk in file-name order, pruning hidden and dependency directories
fn walk(base: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        .filter_map(Result::ok)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

fn display_join(base: &str, rel: &Path) -> String {
    if base.is_empty() || base == "." {
        rel.display().to_string()
    } else {
        Path::new(base).join(rel).display().to_string()
    }
}

fn clip(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
