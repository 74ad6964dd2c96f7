//! Fuzzing engines.
//!
//! An engine only knows how to talk to one fuzzing tool: which command line to build, where the
//! tool writes its statistics and artifacts. Spawning, monitoring and cleanup are shared and
//! live in `crate::adapter`.

use self::stats::StatsRecord;
use crate::{
    result::CoverageInfo,
    session::SessionLayout,
    task::FuzzingTask,
    utils::process::{ProcessSpec, SpawnError},
};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub mod afl;
pub mod crash;
pub mod libfuzzer;
pub mod repro;
pub mod stats;
#[cfg(test)]
pub(crate) mod testing;

/// Marks the position of the input file in the target arguments.
pub const INPUT_PLACEHOLDER: &str = "@@";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("spawn: {0}")]
    Spawn(#[from] SpawnError),
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("minimization: {0}")]
    Minimization(String),
    #[error("reproduction: {0}")]
    Reproduction(String),
    #[error("coverage: {0}")]
    Coverage(String),
    #[error("monitor: {0}")]
    Monitor(String),
    #[error("shutting down")]
    Shutdown,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Per-tool command lines and output locations.
///
/// Everything here is synchronous. `version` runs the tool and `stats`, `crashes` read the
/// session directory, so async callers run them with `spawn_blocking`.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;
    fn supported_platforms(&self) -> &[&'static str];
    fn supported_formats(&self) -> &[&'static str];
    fn is_available(&self) -> bool;
    fn version(&self) -> Option<String>;

    /// Creates directories the tool expects before it starts.
    fn prepare(&self, _layout: &SessionLayout) -> io::Result<()> {
        Ok(())
    }

    fn fuzz_command(&self, task: &FuzzingTask, layout: &SessionLayout) -> ProcessSpec;
    fn stats(&self, layout: &SessionLayout) -> StatsRecord;
    fn crashes(&self, layout: &SessionLayout) -> Vec<PathBuf>;
    fn final_corpus(&self, layout: &SessionLayout) -> PathBuf;

    /// Command that minimizes `testcase` into `out`.
    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        out: &Path,
    ) -> ProcessSpec;

    /// False if the tool has no coverage path, coverage is reported as zero then.
    fn has_coverage(&self) -> bool {
        false
    }

    /// Command that measures coverage of every input in `corpus_dir`.
    fn coverage_command(
        &self,
        _corpus_dir: &Path,
        _target: &Path,
        _args: &[String],
    ) -> Option<ProcessSpec> {
        None
    }

    fn parse_coverage(&self, _output: &str) -> Option<CoverageInfo> {
        None
    }
}

/// Replaces the input placeholder in `args` by `input`, appends `input` if there is none.
pub fn substitute_input(args: &[String], input: &Path) -> Vec<String> {
    let input = input.display().to_string();
    let mut replaced = false;
    let mut ret = args
        .iter()
        .map(|a| {
            if a.contains(INPUT_PLACEHOLDER) {
                replaced = true;
                a.replace(INPUT_PLACEHOLDER, &input)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>();
    if !replaced {
        ret.push(input);
    }
    ret
}

/// Target arguments for tools that do the substitution themselves: the placeholder is kept and
/// appended if missing.
pub fn with_placeholder(args: &[String]) -> Vec<String> {
    let mut ret = args.to_vec();
    if !args.iter().any(|a| a.contains(INPUT_PLACEHOLDER)) {
        ret.push(INPUT_PLACEHOLDER.to_string());
    }
    ret
}

/// Target arguments without the placeholder, for tools that take inputs as trailing paths.
pub fn without_placeholder(args: &[String]) -> Vec<String> {
    args.iter()
        .filter(|a| !a.contains(INPUT_PLACEHOLDER))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn placeholder_substituted() {
        let args = strings(&["-f", "@@", "--input=@@"]);
        let ret = substitute_input(&args, Path::new("/tmp/case"));
        assert_eq!(ret, strings(&["-f", "/tmp/case", "--input=/tmp/case"]));
    }

    #[test]
    fn input_appended_without_placeholder() {
        let args = strings(&["-v"]);
        let ret = substitute_input(&args, Path::new("/tmp/case"));
        assert_eq!(ret, strings(&["-v", "/tmp/case"]));
        assert_eq!(substitute_input(&[], Path::new("x")), strings(&["x"]));
    }

    #[test]
    fn placeholder_kept_or_dropped() {
        assert_eq!(with_placeholder(&strings(&["-v"])), strings(&["-v", "@@"]));
        assert_eq!(with_placeholder(&strings(&["@@", "-v"])), strings(&["@@", "-v"]));
        assert_eq!(without_placeholder(&strings(&["-v", "@@"])), strings(&["-v"]));
    }
}
