//! Engine running the target directly on its first seed, for tests without real fuzzers.

use super::{
    crash::CrashCollector,
    stats::{parse_libfuzzer_log, StatsRecord},
    substitute_input, Engine,
};
use crate::{
    session::SessionLayout,
    task::FuzzingTask,
    utils::process::ProcessSpec,
};
use std::path::{Path, PathBuf};

pub const NAME: &str = "direct";

#[derive(Debug, Clone)]
pub struct DirectEngine {
    crashes: CrashCollector,
}

impl DirectEngine {
    pub fn new() -> Self {
        Self {
            crashes: CrashCollector::new("crashes"),
        }
    }
}

impl Engine for DirectEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_platforms(&self) -> &[&'static str] {
        &["linux"]
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["raw"]
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn fuzz_command(&self, task: &FuzzingTask, layout: &SessionLayout) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&task.target);
        spec.args(substitute_input(&task.args, &layout.input_dir().join("seed")));
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
        layout.input_dir()
    }

    /// Copies the test case through `sh`, dropping its last byte.
    fn minimize_command(
        &self,
        testcase: &Path,
        _target: &Path,
        _args: &[String],
        out: &Path,
    ) -> ProcessSpec {
        let mut spec = ProcessSpec::new("/bin/sh");
        spec.arg("-c")
            .arg("head -c -1 \"$0\" > \"$1\"")
            .arg(testcase.display().to_string())
            .arg(out.display().to_string());
        spec
    }
}
