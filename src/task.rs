use crate::{engine::EngineError, utils::absolute};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io, path::PathBuf, time::Duration};

/// One fuzzing job. Not modified once submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzingTask {
    /// Name of the engine to run, e.g. "afl" or "libfuzzer".
    pub engine: String,
    /// Path to the instrumented target.
    pub target: PathBuf,
    /// Target arguments, `@@` marks the input file position.
    pub args: Vec<String>,
    /// Seed file or directory.
    pub corpus: Option<PathBuf>,
    /// Session time budget in seconds, 0 means unbounded.
    pub timeout_secs: u64,
    /// Memory limit of the target in megabyte, 0 means unlimited.
    pub memory_limit_mb: u64,
    /// Per-input execution timeout in milliseconds.
    pub exec_timeout_ms: Option<u64>,
    pub dictionary: Option<PathBuf>,
    /// Extra engine flags, rendered by each engine in its own syntax.
    pub options: BTreeMap<String, String>,
    /// Overrides the orchestrator work directory for this session.
    pub work_dir: Option<PathBuf>,
    /// Extra environment of the fuzzer process.
    pub env: BTreeMap<String, String>,
    /// Measure coverage of the final corpus once the session ends.
    pub collect_coverage: bool,
    /// Minimize every collected crash once the session ends.
    pub minimize_crashes: bool,
    /// Keep at most this many crash artifacts in the result.
    pub max_crashes: Option<usize>,
}

impl FuzzingTask {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(engine: S, target: P) -> Self {
        Self {
            engine: engine.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }

    /// Same task with target, corpus, dictionary and work dir relative to the current directory
    /// made absolute. Fuzzers run inside their session directory, not in ours.
    pub fn absolute(&self) -> io::Result<FuzzingTask> {
        let mut task = self.clone();
        task.target = absolute(&self.target)?;
        for path in vec![&mut task.corpus, &mut task.dictionary, &mut task.work_dir] {
            if let Some(p) = path {
                *p = absolute(&*p)?;
            }
        }
        Ok(task)
    }

    pub fn check(&self) -> Result<(), EngineError> {
        if self.engine.trim().is_empty() {
            return Err(EngineError::InvalidTask("empty engine name".to_string()));
        }
        if !self.target.is_file() {
            return Err(EngineError::InvalidTask(format!(
                "target not found: {}",
                self.target.display()
            )));
        }
        if let Some(corpus) = self.corpus.as_ref() {
            if !corpus.exists() {
                return Err(EngineError::InvalidTask(format!(
                    "corpus not found: {}",
                    corpus.display()
                )));
            }
        }
        if let Some(dict) = self.dictionary.as_ref() {
            if !dict.is_file() {
                return Err(EngineError::InvalidTask(format!(
                    "dictionary not found: {}",
                    dict.display()
                )));
            }
        }
        if self.max_crashes == Some(0) {
            return Err(EngineError::InvalidTask(
                "max crashes should be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_unbounded() {
        let mut task = FuzzingTask::new("afl", "/bin/true");
        assert_eq!(task.timeout(), None);
        task.timeout_secs = 5;
        assert_eq!(task.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn check_task() {
        assert!(FuzzingTask::new("afl", "/bin/true").check().is_ok());
        assert!(FuzzingTask::new("", "/bin/true").check().is_err());
        assert!(FuzzingTask::new("afl", "/nonexistent/target").check().is_err());

        let task = FuzzingTask {
            corpus: Some(PathBuf::from("/nonexistent/corpus")),
            ..FuzzingTask::new("afl", "/bin/true")
        };
        assert!(matches!(task.check(), Err(EngineError::InvalidTask(_))));

        let task = FuzzingTask {
            max_crashes: Some(0),
            ..FuzzingTask::new("afl", "/bin/true")
        };
        assert!(task.check().is_err());
    }

    #[test]
    fn relative_paths_resolved() {
        let cwd = std::env::current_dir().unwrap();
        let task = FuzzingTask {
            corpus: Some(PathBuf::from("seeds")),
            dictionary: Some(PathBuf::from("/usr/share/dict")),
            work_dir: Some(PathBuf::from("work")),
            ..FuzzingTask::new("afl", "./target")
        };
        let abs = task.absolute().unwrap();
        assert_eq!(abs.target, cwd.join("./target"));
        assert_eq!(abs.corpus, Some(cwd.join("seeds")));
        assert_eq!(abs.dictionary, Some(PathBuf::from("/usr/share/dict")));
        assert_eq!(abs.work_dir, Some(cwd.join("work")));
        assert_eq!(abs.engine, task.engine);
    }

    #[test]
    fn deserialize_with_defaults() {
        let task: FuzzingTask =
            serde_json::from_str(r#"{"engine": "libfuzzer", "target": "/bin/true", "timeout_secs": 5}"#)
                .unwrap();
        assert_eq!(task.engine, "libfuzzer");
        assert_eq!(task.timeout_secs, 5);
        assert!(task.args.is_empty());
        assert_eq!(task.max_crashes, None);
    }
}
