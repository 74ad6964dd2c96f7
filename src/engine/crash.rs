use std::{
    fs::read_dir,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Files fuzzers write next to their artifacts.
pub const NON_ARTIFACTS: [&str; 3] = ["README.txt", ".state", "HONGGFUZZ.REPORT.TXT"];

/// Collects crash artifacts from a fuzzer output directory.
#[derive(Debug, Clone)]
pub struct CrashCollector {
    /// Crash directory relative to the output directory.
    subdir: PathBuf,
    /// If not empty, only file names starting with one of these count.
    prefixes: Vec<&'static str>,
}

impl CrashCollector {
    pub fn new<P: Into<PathBuf>>(subdir: P) -> Self {
        Self {
            subdir: subdir.into(),
            prefixes: Vec::new(),
        }
    }

    pub fn with_prefixes<P: Into<PathBuf>>(subdir: P, prefixes: Vec<&'static str>) -> Self {
        Self {
            subdir: subdir.into(),
            prefixes,
        }
    }

    pub fn crash_dir(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(&self.subdir)
    }

    /// Regular files of the crash directory, sorted. A missing directory gives nothing.
    pub fn collect(&self, out_dir: &Path) -> Vec<PathBuf> {
        let dir = self.crash_dir(out_dir);
        let entries = match read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    log::warn!("failed to scan crash dir {}: {}", dir.display(), e);
                }
                return Vec::new();
            }
        };

        let mut crashes = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| self.is_artifact(&e.file_name().to_string_lossy()))
            .map(|e| e.path())
            .collect::<Vec<_>>();
        crashes.sort();
        crashes
    }

    fn is_artifact(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || NON_ARTIFACTS.contains(&name) {
            return false;
        }
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.starts_with(p))
    }
}
