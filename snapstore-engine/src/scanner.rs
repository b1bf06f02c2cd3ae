//! Directory tree walker feeding `BackupEngine` (§4.8): applies the
//! symlink strategy, hidden-file policy, depth limit and exclude patterns
//! while enumerating candidate files under a source root.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use snapstore_api_types::SymlinkStrategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    #[serde(default)]
    pub symlink_strategy: SymlinkStrategy,
    #[serde(default)]
    pub include_hidden: bool,
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            symlink_strategy: SymlinkStrategy::default(),
            include_hidden: false,
            max_depth: None,
            exclude_patterns: Vec::new(),
        }
    }
}

/// One entry the scanner handed back: a file (or symlink resolved to
/// `Follow`) that should be chunked and stored.
pub struct ScannedFile {
    /// Path relative to the backup source root, forward-slash-normalized.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    /// `Some(target)` for a symlink recorded under `SymlinkStrategy::Record`
    /// — `abs_path` is still the link itself, never chunked.
    pub symlink_target: Option<String>,
}

pub fn scan(source_dir: &Path, options: &BackupOptions) -> Result<Vec<ScannedFile>, Error> {
    let excludes = compile_excludes(&options.exclude_patterns)?;

    let mut walker = WalkDir::new(source_dir).follow_links(false);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut files = Vec::new();

    for entry in walker {
        let entry = entry.map_err(|err| format_err!("walking {source_dir:?} failed - {err}"))?;
        let path = entry.path();

        if path == source_dir {
            continue;
        }

        let rel_path = path
            .strip_prefix(source_dir)
            .map_err(|err| format_err!("path {path:?} escapes source root - {err}"))?;

        if !options.include_hidden && is_hidden(rel_path) {
            if entry.file_type().is_dir() {
                continue;
            }
            continue;
        }

        let rel_str = normalize(rel_path);
        let file_mode = if entry.file_type().is_dir() {
            Some(libc::S_IFDIR as u32)
        } else if entry.file_type().is_symlink() {
            Some(libc::S_IFLNK as u32)
        } else {
            Some(libc::S_IFREG as u32)
        };

        if excludes.matches(rel_str.as_bytes(), file_mode) == Some(MatchType::Exclude) {
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        let is_symlink = entry.file_type().is_symlink();
        if is_symlink {
            match options.symlink_strategy {
                SymlinkStrategy::Skip => continue,
                SymlinkStrategy::Record => {
                    let target = std::fs::read_link(path)
                        .map_err(|err| format_err!("reading symlink {path:?} failed - {err}"))?;
                    let lstat = std::fs::symlink_metadata(path)
                        .map_err(|err| format_err!("lstat {path:?} failed - {err}"))?;
                    let mtime = lstat
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);

                    files.push(ScannedFile {
                        rel_path: rel_str,
                        abs_path: path.to_path_buf(),
                        size: 0,
                        mtime,
                        symlink_target: Some(target.to_string_lossy().into_owned()),
                    });
                    continue;
                }
                SymlinkStrategy::Follow => {} // fall through, metadata() below follows it
            }
        }

        let metadata = entry
            .metadata()
            .map_err(|err| format_err!("stat {path:?} failed - {err}"))?;

        if !metadata.is_file() && !(is_symlink && options.symlink_strategy == SymlinkStrategy::Follow)
        {
            continue;
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        files.push(ScannedFile {
            rel_path: rel_str,
            abs_path: path.to_path_buf(),
            size: metadata.len(),
            mtime,
            symlink_target: None,
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<MatchEntry>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            MatchEntry::parse_pattern(pattern.as_bytes(), PatternFlag::PATH_NAME, MatchType::Exclude)
                .map_err(|err| format_err!("invalid exclude pattern {pattern:?} - {err}"))
        })
        .collect()
}

fn is_hidden(rel_path: &Path) -> bool {
    rel_path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

fn normalize(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn scan_finds_files_sorted_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join(".hidden"), b"h").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();

        let options = BackupOptions::default();
        let files = scan(dir.path(), &options).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.rel_path.as_str()).collect();

        assert_eq!(paths, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[test]
    fn scan_includes_hidden_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden"), b"h").unwrap();

        let options = BackupOptions {
            include_hidden: true,
            ..Default::default()
        };
        let files = scan(dir.path(), &options).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, ".hidden");
    }

    #[test]
    fn scan_honors_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        fs::write(dir.path().join("skip.log"), b"s").unwrap();

        let options = BackupOptions {
            exclude_patterns: vec!["*.log".to_string()],
            ..Default::default()
        };
        let files = scan(dir.path(), &options).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }
}
