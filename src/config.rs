use crate::{
    engine::{
        afl::AflConfig,
        libfuzzer::LibFuzzerConfig,
        repro::{CrashClassifier, DEFAULT_CRASH_MARKERS},
    },
    session::DEFAULT_RETAINED_SESSIONS,
};
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("work dir: {0}")]
    WorkDir(String),
    #[error("timeout '{0}' should be at least 1s")]
    Timeout(&'static str),
    #[error("crash markers: {0}")]
    Markers(String),
    #[error("retained sessions should be at least 1")]
    RetainedSessions,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of all session directories.
    pub work_dir: PathBuf,
    pub afl: AflConfig,
    pub libfuzzer: LibFuzzerConfig,
    /// Output markers used to classify reproduced crashes.
    pub crash_markers: Vec<String>,
    pub repro_timeout: Duration,
    pub minimize_timeout: Duration,
    pub coverage_timeout: Duration,
    /// Finished sessions kept for `status` before the oldest is forgotten.
    pub retained_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: env::temp_dir().join("fuzzvisor"),
            afl: AflConfig::default(),
            libfuzzer: LibFuzzerConfig::default(),
            crash_markers: DEFAULT_CRASH_MARKERS.iter().map(|m| m.to_string()).collect(),
            repro_timeout: Duration::from_secs(30),
            minimize_timeout: Duration::from_secs(300),
            coverage_timeout: Duration::from_secs(300),
            retained_sessions: DEFAULT_RETAINED_SESSIONS,
        }
    }
}

impl Config {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::WorkDir("empty path".to_string()));
        }
        if self.work_dir.exists() && !self.work_dir.is_dir() {
            return Err(ConfigError::WorkDir(format!(
                "not a directory: {}",
                self.work_dir.display()
            )));
        }
        for (name, du) in &[
            ("repro_timeout", self.repro_timeout),
            ("minimize_timeout", self.minimize_timeout),
            ("coverage_timeout", self.coverage_timeout),
        ] {
            if du.as_secs() == 0 {
                return Err(ConfigError::Timeout(*name));
            }
        }
        if self.crash_markers.iter().any(|m| m.is_empty()) {
            return Err(ConfigError::Markers("empty marker".to_string()));
        }
        if self.retained_sessions == 0 {
            return Err(ConfigError::RetainedSessions);
        }
        Ok(())
    }

    pub fn classifier(&self) -> CrashClassifier {
        CrashClassifier::new(self.crash_markers.clone())
    }
}

/// Reads crash markers, one per line. Blank lines and `#` comments are skipped.
pub fn load_markers<P: AsRef<Path>>(path: P) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let content = read_to_string(path)?;
    let markers = content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect::<Vec<_>>();
    if markers.is_empty() {
        return Err(ConfigError::Markers(format!(
            "no marker in {}",
            path.display()
        )));
    }
    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;

    #[test]
    fn default_config_ok() {
        let config = Config::default();
        assert!(config.check().is_ok());
        assert_eq!(config.crash_markers.len(), DEFAULT_CRASH_MARKERS.len());
    }

    #[test]
    fn bad_config() {
        let config = Config {
            repro_timeout: Duration::from_millis(10),
            ..Config::default()
        };
        assert!(matches!(config.check(), Err(ConfigError::Timeout("repro_timeout"))));

        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config {
            work_dir: file.path().to_path_buf(),
            ..Config::default()
        };
        assert!(matches!(config.check(), Err(ConfigError::WorkDir(_))));

        let config = Config {
            retained_sessions: 0,
            ..Config::default()
        };
        assert!(matches!(config.check(), Err(ConfigError::RetainedSessions)));
    }

    #[test]
    fn markers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers");
        write(&path, "# sanitizers\nAddressSanitizer\n\n  BOOM  \n").unwrap();
        assert_eq!(load_markers(&path).unwrap(), vec!["AddressSanitizer", "BOOM"]);

        write(&path, "# nothing\n").unwrap();
        assert!(load_markers(&path).is_err());
    }
}
