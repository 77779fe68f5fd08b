use directories::ProjectDirs;
use std::path::PathBuf;

/// Platform-specific locations for configuration, data and cache.
///
/// Follows the XDG Base Directory spec on Linux, `~/Library/Application Support`
/// on macOS and `%APPDATA%` on Windows, as resolved by the `directories` crate.
pub struct ProjectPaths {
    dirs: ProjectDirs,
}

impl ProjectPaths {
    /// Resolve the paths for the given application name.
    ///
    /// Returns `None` when no home directory can be determined.
    pub fn new(name: &str) -> Option<Self> {
        ProjectDirs::from("", "", name).map(|dirs| ProjectPaths { dirs })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dirs.config_dir().to_path_buf()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dirs.data_dir().to_path_buf()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dirs.cache_dir().to_path_buf()
    }
}
