//! Script directory listing and change detection for hot reload

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use crate::script::SCRIPT_EXTENSION;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(1000);

/// Differences between two scans of a script directory
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub changed: Vec<(PathBuf, SystemTime)>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }
}

fn is_script_file(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some(SCRIPT_EXTENSION)
}

/// Script files under `dir`, sorted by path.
///
/// A missing or unreadable directory yields an empty list.
pub fn list_script_files(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = scripts_with_mtime(dir, recursive).into_keys().collect();
    files.sort();
    files
}

fn scripts_with_mtime(dir: &Path, recursive: bool) -> HashMap<PathBuf, SystemTime> {
    let mut scripts = HashMap::new();
    if !dir.exists() {
        debug!(target: "scripting", "Script directory does not exist: {}", dir.display());
        return scripts;
    }
    collect(dir, recursive, &mut scripts);
    scripts
}

fn collect(dir: &Path, recursive: bool, scripts: &mut HashMap<PathBuf, SystemTime>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(target: "scripting", "Failed to read script directory {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(target: "scripting", "Failed to read metadata for {}: {}", path.display(), e);
                continue;
            }
        };

        if metadata.is_dir() {
            if recursive {
                collect(&path, recursive, scripts);
            }
            continue;
        }

        if !is_script_file(&path) {
            continue;
        }

        match metadata.modified() {
            Ok(modified) => {
                scripts.insert(path, modified);
            }
            Err(e) => {
                warn!(
                    target: "scripting",
                    "Failed to get modification time for {}: {}",
                    path.display(),
                    e
                );
            }
        }
    }
}

/// Polls a script directory and reports what changed since the last scan
pub struct ScriptScanner {
    script_dir: PathBuf,
    recursive: bool,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    known: HashMap<PathBuf, SystemTime>,
}

impl ScriptScanner {
    pub fn new(script_dir: PathBuf, recursive: bool) -> Self {
        Self::with_interval(script_dir, recursive, DEFAULT_SCAN_INTERVAL)
    }

    /// Files present at creation are treated as already known
    pub fn with_interval(script_dir: PathBuf, recursive: bool, scan_interval: Duration) -> Self {
        let known = scripts_with_mtime(&script_dir, recursive);
        Self {
            script_dir,
            recursive,
            scan_interval,
            last_scan: None,
            known,
        }
    }

    pub fn script_dir(&self) -> &Path {
        &self.script_dir
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn should_scan(&self) -> bool {
        self.last_scan
            .map_or(true, |last| last.elapsed() >= self.scan_interval)
    }

    pub fn scan_changes(&mut self) -> ScanResult {
        self.last_scan = Some(Instant::now());
        debug!(target: "scripting", "Scanning {} for script changes", self.script_dir.display());

        let current = scripts_with_mtime(&self.script_dir, self.recursive);
        let mut result = ScanResult::default();

        for (path, modified) in &current {
            match self.known.get(path) {
                Some(previous) if previous != modified => {
                    debug!(target: "scripting", "Script changed: {}", path.display());
                    result.changed.push((path.clone(), *modified));
                }
                Some(_) => {}
                None => {
                    debug!(target: "scripting", "Script added: {}", path.display());
                    result.added.push(path.clone());
                }
            }
        }

        for path in self.known.keys() {
            if !current.contains_key(path) {
                debug!(target: "scripting", "Script removed: {}", path.display());
                result.removed.push(path.clone());
            }
        }

        result.added.sort();
        result.removed.sort();
        self.known = current;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_should_scan_timing() {
        let temp_dir = TempDir::new().unwrap();
        let mut scanner = ScriptScanner::with_interval(
            temp_dir.path().to_path_buf(),
            false,
            Duration::from_millis(50),
        );

        assert!(scanner.should_scan());
        scanner.scan_changes();
        assert!(!scanner.should_scan());

        std::thread::sleep(Duration::from_millis(60));
        assert!(scanner.should_scan());
    }

    #[test]
    fn test_existing_files_are_known() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("a.rhai")).unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf(), false);
        assert!(!scanner.scan_changes().has_changes());
    }

    #[test]
    fn test_detect_added_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let old = temp_dir.path().join("old.rhai");
        File::create(&old).unwrap();
        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf(), false);

        let new = temp_dir.path().join("new.rhai");
        File::create(&new).unwrap();
        fs::remove_file(&old).unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.added, vec![new]);
        assert_eq!(result.removed, vec![old]);
        assert!(result.changed.is_empty());
    }

    #[test]
    fn test_detect_modified_script() {
        let temp_dir = TempDir::new().unwrap();
        let script_path = temp_dir.path().join("test.rhai");
        File::create(&script_path).unwrap().write_all(b"true").unwrap();

        let mut scanner = ScriptScanner::new(temp_dir.path().to_path_buf(), false);

        // Coarse mtime resolution on some filesystems
        std::thread::sleep(Duration::from_millis(1100));
        File::create(&script_path).unwrap().write_all(b"false").unwrap();

        let result = scanner.scan_changes();
        assert_eq!(result.changed.len(), 1);
        assert_eq!(result.changed[0].0, script_path);
    }

    #[test]
    fn test_list_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        File::create(temp_dir.path().join("b.rhai")).unwrap();
        File::create(temp_dir.path().join("a.rhai")).unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();

        let files = list_script_files(temp_dir.path(), false);
        assert_eq!(
            files,
            vec![temp_dir.path().join("a.rhai"), temp_dir.path().join("b.rhai")]
        );
    }

    #[test]
    fn test_list_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        File::create(temp_dir.path().join("top.rhai")).unwrap();
        File::create(nested.join("inner.rhai")).unwrap();

        assert_eq!(list_script_files(temp_dir.path(), false).len(), 1);
        assert_eq!(list_script_files(temp_dir.path(), true).len(), 2);
    }

    #[test]
    fn test_handles_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        let mut scanner = ScriptScanner::new(missing.clone(), true);
        assert!(!scanner.scan_changes().has_changes());
        assert!(list_script_files(&missing, true).is_empty());
    }
}
