//! Result records produced by sessions and helper runs.

use crate::engine::stats::StatsRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, path::PathBuf};

/// Lifecycle of a session: `Running` moves to exactly one of the terminal states.
/// `Unknown` is only reported for ids not in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Completed,
    Timeout,
    Stopped,
    Error,
    Unknown,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Timeout
                | SessionStatus::Stopped
                | SessionStatus::Error
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Timeout => "TIMEOUT",
            SessionStatus::Stopped => "STOPPED",
            SessionStatus::Error => "ERROR",
            SessionStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FuzzingStatistics {
    pub execs_per_sec: f64,
    pub peak_memory_mb: u64,
    pub corpus_size: u64,
    pub timeouts: u64,
    pub ooms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageInfo {
    pub covered_edges: u64,
    pub features: u64,
    pub total_edges: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReproductionResult {
    pub testcase: PathBuf,
    pub reproduced: bool,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub crash_type: Option<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub output: String,
}

/// Final record of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuzzingResult {
    pub session_id: String,
    pub engine: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub execution_count: u64,
    pub coverage: f64,
    pub crash_count: usize,
    pub crash_files: Vec<PathBuf>,
    pub minimized_crashes: Vec<PathBuf>,
    pub exit_code: i32,
    pub successful: bool,
    pub error_message: Option<String>,
    pub statistics: FuzzingStatistics,
    pub final_corpus: PathBuf,
    pub coverage_info: Option<CoverageInfo>,
}

/// Turns the raw end state of a session into a `FuzzingResult`.
#[derive(Debug, Clone)]
pub struct ResultAssembler {
    session_id: String,
    engine: String,
    start_time: DateTime<Utc>,
    status: SessionStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    stats: StatsRecord,
    crashes: Vec<PathBuf>,
    minimized: Vec<PathBuf>,
    final_corpus: PathBuf,
    coverage: Option<CoverageInfo>,
}

impl ResultAssembler {
    pub fn new(session_id: &str, engine: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            engine: engine.to_string(),
            start_time,
            status: SessionStatus::Error,
            exit_code: None,
            error: None,
            stats: StatsRecord::default(),
            crashes: Vec::new(),
            minimized: Vec::new(),
            final_corpus: PathBuf::new(),
            coverage: None,
        }
    }

    pub fn exit(&mut self, status: SessionStatus, exit_code: Option<i32>) -> &mut Self {
        self.status = status;
        self.exit_code = exit_code;
        self
    }

    pub fn error<S: Into<String>>(&mut self, msg: S) -> &mut Self {
        self.error = Some(msg.into());
        self
    }

    pub fn stats(&mut self, stats: StatsRecord) -> &mut Self {
        self.stats = stats;
        self
    }

    /// Crash artifacts, capped to `max` files if given.
    pub fn crashes(&mut self, mut crashes: Vec<PathBuf>, max: Option<usize>) -> &mut Self {
        if let Some(max) = max {
            crashes.truncate(max);
        }
        self.crashes = crashes;
        self
    }

    pub fn minimized(&mut self, minimized: Vec<PathBuf>) -> &mut Self {
        self.minimized = minimized;
        self
    }

    pub fn final_corpus(&mut self, dir: PathBuf) -> &mut Self {
        self.final_corpus = dir;
        self
    }

    pub fn coverage(&mut self, coverage: CoverageInfo) -> &mut Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn crash_files(&self) -> &[PathBuf] {
        &self.crashes
    }

    pub fn finish(self) -> FuzzingResult {
        let exit_code = self.exit_code.unwrap_or(-1);
        let successful = self.exit_code == Some(0) && self.error.is_none();
        FuzzingResult {
            session_id: self.session_id,
            engine: self.engine,
            status: self.status,
            start_time: self.start_time,
            end_time: Utc::now(),
            execution_count: self.stats.execs_done,
            coverage: self.stats.coverage,
            crash_count: self.crashes.len(),
            crash_files: self.crashes,
            minimized_crashes: self.minimized,
            exit_code,
            successful,
            error_message: self.error,
            statistics: FuzzingStatistics {
                execs_per_sec: self.stats.execs_per_sec,
                peak_memory_mb: self.stats.peak_rss_mb,
                corpus_size: self.stats.corpus_count,
                timeouts: self.stats.unique_hangs,
                ooms: self.stats.ooms,
            },
            final_corpus: self.final_corpus,
            coverage_info: self.coverage,
        }
    }
}
