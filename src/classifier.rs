//! Maps a command's executable to HIGH/MEDIUM/LOW using gitignore-style
//! whitelist pattern files.

use std::path::{Path, PathBuf};

use crate::job::LoadLevel;

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Trailing-slash lines: directory prefixes.
    dir_prefixes: Vec<PathBuf>,
    /// Lines containing `/` with no trailing slash: exact absolute paths.
    exact_paths: Vec<PathBuf>,
    /// Bare-name lines, lower-cased for case-insensitive basename matching.
    names: Vec<String>,
}

impl Whitelist {
    pub fn parse(contents: &str) -> Self {
        let mut wl = Whitelist::default();
        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(prefix) = line.strip_suffix('/') {
                wl.dir_prefixes.push(PathBuf::from(prefix));
            } else if line.contains('/') {
                wl.exact_paths.push(PathBuf::from(line));
            } else {
                wl.names.push(line.to_lowercase());
            }
        }
        wl
    }

    /// Load from `path`; a missing file means an empty whitelist (spec §4.3).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Whitelist::parse(&contents),
            Err(_) => Whitelist::default(),
        }
    }

    fn matches(&self, executable: &str) -> bool {
        let exec_path = Path::new(executable);
        let resolved = exec_path
            .canonicalize()
            .unwrap_or_else(|_| exec_path.to_path_buf());

        if self.dir_prefixes.iter().any(|p| resolved.starts_with(p)) {
            return true;
        }
        if self.exact_paths.iter().any(|p| *p == resolved || p.as_path() == exec_path) {
            return true;
        }
        if let Some(basename) = exec_path.file_name().and_then(|n| n.to_str()) {
            let basename_lower = basename.to_lowercase();
            if self.names.iter().any(|n| *n == basename_lower) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadWhitelists {
    pub high: Whitelist,
    pub medium: Whitelist,
    pub low: Whitelist,
}

impl LoadWhitelists {
    /// Load the three whitelist files from the system config directory.
    /// Conventional filenames: `high.whitelist`, `medium.whitelist`,
    /// `low.whitelist`.
    pub fn load_from_dir(config_dir: &Path) -> Self {
        LoadWhitelists {
            high: Whitelist::load(&config_dir.join("high.whitelist")),
            medium: Whitelist::load(&config_dir.join("medium.whitelist")),
            low: Whitelist::load(&config_dir.join("low.whitelist")),
        }
    }
}

pub struct LoadClassifier {
    whitelists: LoadWhitelists,
}

impl LoadClassifier {
    pub fn new(whitelists: LoadWhitelists) -> Self {
        LoadClassifier { whitelists }
    }

    /// Classify `command`'s first element (the executable reference).
    /// Falls back to MEDIUM when no whitelist matches (spec §4.3).
    pub fn classify(&self, command: &[String]) -> LoadLevel {
        let Some(executable) = command.first() else {
            return LoadLevel::Medium;
        };
        if self.whitelists.high.matches(executable) {
            LoadLevel::High
        } else if self.whitelists.medium.matches(executable) {
            LoadLevel::Medium
        } else if self.whitelists.low.matches(executable) {
            LoadLevel::Low
        } else {
            LoadLevel::Medium
        }
    }
}
