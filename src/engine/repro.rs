//! Crash reproduction: run the target on one input and classify what happened.

use super::{substitute_input, EngineError};
use crate::{
    result::ReproductionResult,
    utils::process::{ProcessHandle, ProcessSpec, WaitOutcome},
};
use std::{
    future::Future,
    path::Path,
    time::{Duration, Instant},
};

/// Output markers of known crash kinds, checked in order.
pub const DEFAULT_CRASH_MARKERS: [&str; 13] = [
    "AddressSanitizer",
    "MemorySanitizer",
    "ThreadSanitizer",
    "UndefinedBehaviorSanitizer",
    "LeakSanitizer",
    "runtime error:",
    "SIGSEGV",
    "SIGABRT",
    "SIGBUS",
    "SIGFPE",
    "SIGILL",
    "Segmentation fault",
    "panicked at",
];

/// Best effort crash classification based on output markers and the terminating signal.
#[derive(Debug, Clone)]
pub struct CrashClassifier {
    markers: Vec<String>,
}

impl Default for CrashClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CRASH_MARKERS.iter().map(|m| m.to_string()).collect())
    }
}

impl CrashClassifier {
    pub fn new(markers: Vec<String>) -> Self {
        Self { markers }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn classify(
        &self,
        output: &str,
        signal: Option<i32>,
        timed_out: bool,
        reproduced: bool,
    ) -> Option<String> {
        if let Some(m) = self.markers.iter().find(|m| output.contains(m.as_str())) {
            return Some(m.clone());
        }
        if let Some(name) = signal.and_then(signal_hook::low_level::signal_name) {
            return Some(name.to_string());
        }
        if timed_out {
            Some("timeout".to_string())
        } else if reproduced {
            Some("unknown".to_string())
        } else {
            None
        }
    }
}

/// Runs `target` on `testcase` once. A non-zero exit or a timeout counts as reproduced.
/// The run is killed and `Shutdown` returned if `shutdown` resolves first.
pub async fn reproduce<F: Future<Output = ()>>(
    classifier: &CrashClassifier,
    testcase: &Path,
    target: &Path,
    args: &[String],
    timeout: Duration,
    shutdown: F,
) -> Result<ReproductionResult, EngineError> {
    if !testcase.is_file() {
        return Err(EngineError::Reproduction(format!(
            "test case not found: {}",
            testcase.display()
        )));
    }
    let mut spec = ProcessSpec::new(target);
    spec.args(substitute_input(args, testcase));

    let now = Instant::now();
    let mut p = ProcessHandle::spawn(&spec)?;
    tokio::pin!(shutdown);
    let outcome = tokio::select! {
        r = p.wait_timeout(Some(timeout)) => Some(r?),
        _ = &mut shutdown => None,
    };
    let timed_out = match outcome {
        Some(WaitOutcome::Exited(_)) => false,
        Some(WaitOutcome::TimedOut) => {
            p.terminate().await?;
            true
        }
        None => {
            p.terminate().await?;
            return Err(EngineError::Shutdown);
        }
    };
    let duration_ms = now.elapsed().as_millis() as u64;
    let exit_code = p.exit_code().unwrap_or(-1);
    let signal = if timed_out { None } else { p.signal() };
    let output = String::from_utf8_lossy(&p.finish_output().await).into_owned();
    let reproduced = timed_out || exit_code != 0;
    let crash_type = classifier.classify(&output, signal, timed_out, reproduced);
    log::debug!(
        "reproduce {}: exit {}, crash type {:?}",
        testcase.display(),
        exit_code,
        crash_type
    );

    Ok(ReproductionResult {
        testcase: testcase.to_path_buf(),
        reproduced,
        exit_code,
        signal,
        crash_type,
        timed_out,
        duration_ms,
        output,
    })
}
