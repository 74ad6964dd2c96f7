//! AFL and AFL++ (`afl-fuzz`, `afl-tmin`).

use super::{
    crash::CrashCollector,
    stats::{parse_afl_stats, StatsRecord},
    with_placeholder, Engine,
};
use crate::{
    session::SessionLayout,
    task::FuzzingTask,
    utils::{process::ProcessSpec, which},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::Command,
};

pub const NAME: &str = "afl";

/// Default instance name of afl++, which nests its output one level deeper.
const DEFAULT_INSTANCE: &str = "default";

lazy_static! {
    static ref VERSION: Regex = Regex::new(r"afl-fuzz\s*(\+\+)?\s*([0-9][0-9a-z.]*)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AflConfig {
    pub afl_fuzz: PathBuf,
    pub afl_tmin: PathBuf,
}

impl Default for AflConfig {
    fn default() -> Self {
        Self {
            afl_fuzz: PathBuf::from("afl-fuzz"),
            afl_tmin: PathBuf::from("afl-tmin"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AflEngine {
    config: AflConfig,
    crashes: CrashCollector,
}

impl AflEngine {
    pub fn new(config: AflConfig) -> Self {
        Self {
            config,
            crashes: CrashCollector::new("crashes"),
        }
    }

    /// Directory holding `fuzzer_stats`, `queue/` and `crashes/`.
    fn instance_dir(&self, layout: &SessionLayout) -> PathBuf {
        let nested = layout.output_dir().join(DEFAULT_INSTANCE);
        if nested.join("fuzzer_stats").is_file() || nested.join("queue").is_dir() {
            nested
        } else {
            layout.output_dir()
        }
    }
}

impl Engine for AflEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_platforms(&self) -> &[&'static str] {
        &["linux", "macos", "freebsd", "netbsd", "openbsd"]
    }

    fn supported_formats(&self) -> &[&'static str] {
        &["raw", "text"]
    }

    fn is_available(&self) -> bool {
        which(&self.config.afl_fuzz).is_some()
    }

    fn version(&self) -> Option<String> {
        let output = Command::new(&self.config.afl_fuzz)
            .arg("-h")
            .env("AFL_NO_UI", "1")
            .output()
            .ok()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        parse_afl_version(&text)
    }

    fn fuzz_command(&self, task: &FuzzingTask, layout: &SessionLayout) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.afl_fuzz);
        spec.arg("-i")
            .arg(layout.input_dir().display().to_string())
            .arg("-o")
            .arg(layout.output_dir().display().to_string())
            .arg("-m");
        if task.memory_limit_mb == 0 {
            spec.arg("none");
        } else {
            spec.arg(task.memory_limit_mb.to_string());
        }
        if let Some(ms) = task.exec_timeout_ms {
            spec.arg("-t").arg(ms.to_string());
        }
        if let Some(dict) = task.dictionary.as_ref() {
            spec.arg("-x").arg(dict.display().to_string());
        }
        for (k, v) in &task.options {
            spec.arg(format!("-{}", k.trim_start_matches('-')));
            if !v.is_empty() {
                spec.arg(v.clone());
            }
        }
        spec.arg("--")
            .arg(task.target.display().to_string())
            .args(with_placeholder(&task.args));

        spec.env("AFL_NO_UI", "1")
            .env("AFL_SKIP_CPUFREQ", "1")
            .env("AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES", "1");
        for (k, v) in &task.env {
            spec.env(k.clone(), v.clone());
        }
        spec.current_dir(layout.root());
        spec
    }

    fn stats(&self, layout: &SessionLayout) -> StatsRecord {
        parse_afl_stats(self.instance_dir(layout).join("fuzzer_stats"))
    }

    fn crashes(&self, layout: &SessionLayout) -> Vec<PathBuf> {
        self.crashes.collect(&self.instance_dir(layout))
    }

    fn final_corpus(&self, layout: &SessionLayout) -> PathBuf {
        self.instance_dir(layout).join("queue")
    }

    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        out: &Path,
    ) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.afl_tmin);
        spec.arg("-i")
            .arg(testcase.display().to_string())
            .arg("-o")
            .arg(out.display().to_string())
            .arg("--")
            .arg(target.display().to_string())
            .args(with_placeholder(args));
        spec.env("AFL_NO_UI", "1");
        spec
    }
}

/// Version from the banner, e.g. `afl-fuzz++4.00c` gives `++4.00c`.
pub fn parse_afl_version(banner: &str) -> Option<String> {
    let caps = VERSION.captures(banner)?;
    let plus = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    Some(format!("{}{}", plus, caps.get(2)?.as_str()))
}
