//! libFuzzer targets: the target binary is the fuzzer.

use super::{
    crash::CrashCollector,
    stats::{parse_libfuzzer_features, parse_libfuzzer_log, StatsRecord},
    without_placeholder, Engine,
};
use crate::{
    result::CoverageInfo,
    session::SessionLayout,
    task::FuzzingTask,
    utils::process::ProcessSpec,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::create_dir_all,
    io,
    path::{Path, PathBuf},
    process::Command,
};

pub const NAME: &str = "libfuzzer";

/// Artifact prefixes that denote crashes, `timeout-`, `oom-` and `slow-unit-` do not.
const CRASH_PREFIXES: [&str; 2] = ["crash-", "leak-"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibFuzzerConfig {
    /// `-runs` of a minimization run.
    pub minimize_runs: u64,
    /// Compiler queried for the version, libFuzzer ships with it.
    pub clang: PathBuf,
}

impl Default for LibFuzzerConfig {
    fn default() -> Self {
        Self {
            minimize_runs: 10000,
            clang: PathBuf::from("clang"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LibFuzzerEngine {
    config: LibFuzzerConfig,
    crashes: CrashCollector,
}

impl LibFuzzerEngine {
    pub fn new(config: LibFuzzerConfig) -> Self {
        Self {
            config,
            crashes: CrashCollector::with_prefixes("crashes", CRASH_PREFIXES.to_vec()),
        }
    }
}

impl Engine for LibFuzzerEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_platforms(&self) -> &[&'static str] {
        &["linux", "macos", "windows"]
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["raw", "text", "structured"]
    }

    /// Always true: the runtime is linked into every target.
    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        let output = Command::new(&self.config.clang)
            .arg("--version")
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
    }

    fn prepare(&self, layout: &SessionLayout) -> io::Result<()> {
        create_dir_all(layout.queue_dir())?;
        create_dir_all(layout.crash_dir())
    }

    fn fuzz_command(&self, task: &FuzzingTask, layout: &SessionLayout) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&task.target);
        for (k, v) in &task.options {
            spec.arg(format!("-{}={}", k.trim_start_matches('-'), v));
        }
        spec.arg(format!("-artifact_prefix={}/", layout.crash_dir().display()))
            .arg(format!("-rss_limit_mb={}", task.memory_limit_mb));
        if let Some(ms) = task.exec_timeout_ms {
            // libFuzzer only takes whole seconds.
            spec.arg(format!("-timeout={}", ((ms + 999) / 1000).max(1)));
        }
        if let Some(dict) = task.dictionary.as_ref() {
            spec.arg(format!("-dict={}", dict.display()));
        }
        spec.arg("-print_final_stats=1")
            .args(without_placeholder(&task.args))
            .arg(layout.queue_dir().display().to_string())
            .arg(layout.input_dir().display().to_string());
        for (k, v) in &task.env {
            spec.env(k.clone(), v.clone());
        }
        spec.current_dir(layout.root());
        spec
    }

    fn stats(&self, layout: &SessionLayout) -> StatsRecord {
        parse_libfuzzer_log(layout.log_file())
    }

    fn crashes(&self, layout: &SessionLayout) -> Vec<PathBuf> {
        self.crashes.collect(&layout.output_dir())
    }

    fn final_corpus(&self, layout: &SessionLayout) -> PathBuf {
        layout.queue_dir()
    }

    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        out: &Path,
    ) -> ProcessSpec {
        let mut spec = ProcessSpec::new(target);
        spec.arg("-minimize_crash=1")
            .arg(format!("-runs={}", self.config.minimize_runs))
            .arg(format!("-exact_artifact_path={}", out.display()))
            .args(without_placeholder(args))
            .arg(testcase.display().to_string());
        spec
    }

    fn has_coverage(&self) -> bool {
        true
    }

    fn coverage_command(
        &self,
        corpus_dir: &Path,
        target: &Path,
        args: &[String],
    ) -> Option<ProcessSpec> {
        let mut spec = ProcessSpec::new(target);
        spec.arg("-runs=0")
            .args(without_placeholder(args))
            .arg(corpus_dir.display().to_string());
        Some(spec)
    }

    fn parse_coverage(&self, output: &str) -> Option<CoverageInfo> {
        let (covered_edges, features) = parse_libfuzzer_features(output)?;
        Some(CoverageInfo {
            covered_edges,
            features,
            ..CoverageInfo::default()
        })
    }
}
