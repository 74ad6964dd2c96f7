//! Tolerant parsing of live fuzzer statistics.
//!
//! The files parsed here are rewritten by the fuzzer while we read them, so every read is a
//! one-shot snapshot and any field that does not parse is skipped.

use lazy_static::lazy_static;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::{fs::read_to_string, io, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats unavailable '{path}': {source}")]
    Unavailable {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed value for '{key}': {value}")]
    Malformed { key: String, value: String },
}

/// Snapshot of a fuzzer's statistics. Zero-valued when nothing could be read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsRecord {
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub corpus_count: u64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    /// Coverage map usage, in percent for AFL, in covered edges for libFuzzer.
    pub coverage: f64,
    pub edges_found: u64,
    pub peak_rss_mb: u64,
    pub ooms: u64,
    pub cycles_done: u64,
    pub stability: f64,
    pub fuzzer_version: Option<String>,
    pub command_line: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    ExecsDone,
    ExecsPerSec,
    CorpusCount,
    UniqueCrashes,
    UniqueHangs,
    Coverage,
    EdgesFound,
    PeakRss,
    CyclesDone,
    Stability,
    Version,
    CommandLine,
}

lazy_static! {
    /// `fuzzer_stats` keys of AFL and AFL++, old and new names.
    static ref AFL_KEYS: FxHashMap<&'static str, Field> = {
        fxhashmap! {
            "execs_done"        => Field::ExecsDone,
            "execs_per_sec"     => Field::ExecsPerSec,
            "paths_total"       => Field::CorpusCount,
            "corpus_count"      => Field::CorpusCount,
            "unique_crashes"    => Field::UniqueCrashes,
            "saved_crashes"     => Field::UniqueCrashes,
            "unique_hangs"      => Field::UniqueHangs,
            "saved_hangs"       => Field::UniqueHangs,
            "bitmap_cvg"        => Field::Coverage,
            "edges_found"       => Field::EdgesFound,
            "peak_rss_mb"       => Field::PeakRss,
            "cycles_done"       => Field::CyclesDone,
            "stability"         => Field::Stability,
            "afl_version"       => Field::Version,
            "command_line"      => Field::CommandLine,
        }
    };
    /// `-print_final_stats=1` keys of libFuzzer, without the `stat::` prefix.
    static ref LIBFUZZER_KEYS: FxHashMap<&'static str, Field> = {
        fxhashmap! {
            "number_of_executed_units"  => Field::ExecsDone,
            "average_exec_per_sec"      => Field::ExecsPerSec,
            "peak_rss_mb"               => Field::PeakRss,
        }
    };
    static ref PROGRESS_LINE: Regex = Regex::new(r"^#(\d+)\s+\w+").unwrap();
    static ref COV: Regex = Regex::new(r"\bcov: (\d+)").unwrap();
    static ref FT: Regex = Regex::new(r"\bft: (\d+)").unwrap();
    static ref CORP: Regex = Regex::new(r"\bcorp: (\d+)/").unwrap();
    static ref EXEC_SPEED: Regex = Regex::new(r"\bexec/s: (\d+)").unwrap();
    static ref RSS: Regex = Regex::new(r"\brss: (\d+)Mb").unwrap();
}

/// Splits a `key : value` line. libFuzzer's `stat::` prefix is removed.
pub fn split_stat_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let line = line.strip_prefix("stat::").unwrap_or(line);
    let (key, val) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, val.trim()))
}

fn read_stats(path: &Path) -> Result<String, StatsError> {
    read_to_string(path).map_err(|source| StatsError::Unavailable {
        path: path.display().to_string(),
        source,
    })
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, StatsError> {
    value
        .trim_end_matches('%')
        .trim()
        .parse()
        .map_err(|_| StatsError::Malformed {
            key: key.to_string(),
            value: value.to_string(),
        })
}

impl StatsRecord {
    fn apply(&mut self, field: Field, key: &str, value: &str) -> Result<(), StatsError> {
        match field {
            Field::ExecsDone => self.execs_done = parse_num(key, value)?,
            Field::ExecsPerSec => self.execs_per_sec = parse_num(key, value)?,
            Field::CorpusCount => self.corpus_count = parse_num(key, value)?,
            Field::UniqueCrashes => self.unique_crashes = parse_num(key, value)?,
            Field::UniqueHangs => self.unique_hangs = parse_num(key, value)?,
            Field::Coverage => self.coverage = parse_num(key, value)?,
            Field::EdgesFound => self.edges_found = parse_num(key, value)?,
            Field::PeakRss => self.peak_rss_mb = parse_num(key, value)?,
            Field::CyclesDone => self.cycles_done = parse_num(key, value)?,
            Field::Stability => self.stability = parse_num(key, value)?,
            Field::Version => self.fuzzer_version = Some(value.to_string()),
            Field::CommandLine => self.command_line = Some(value.to_string()),
        }
        Ok(())
    }

    fn apply_lines<'a>(&mut self, keys: &FxHashMap<&'static str, Field>, lines: impl Iterator<Item = &'a str>) {
        for line in lines {
            let (key, value) = match split_stat_line(line) {
                Some(kv) => kv,
                None => continue,
            };
            if let Some(field) = keys.get(key) {
                if let Err(e) = self.apply(*field, key, value) {
                    log::debug!("skip stats field: {}", e);
                }
            }
        }
    }
}

/// Parses an AFL `fuzzer_stats` file. A missing file gives a zero-valued record.
pub fn parse_afl_stats<P: AsRef<Path>>(path: P) -> StatsRecord {
    let mut record = StatsRecord::default();
    match read_stats(path.as_ref()) {
        Ok(content) => record.apply_lines(&AFL_KEYS, content.lines()),
        Err(e) => log::warn!("{}", e),
    }
    record
}

/// Parses the captured output of a libFuzzer run. A missing file gives a zero-valued record.
pub fn parse_libfuzzer_log<P: AsRef<Path>>(path: P) -> StatsRecord {
    match read_stats(path.as_ref()) {
        Ok(content) => parse_libfuzzer_output(&content),
        Err(e) => {
            log::warn!("{}", e);
            StatsRecord::default()
        }
    }
}

/// Parses libFuzzer output: the last progress line, final stats and timeout/oom events.
pub fn parse_libfuzzer_output(content: &str) -> StatsRecord {
    let mut record = StatsRecord::default();

    if let Some(line) = content.lines().rev().find(|l| PROGRESS_LINE.is_match(l)) {
        record.execs_done = capture(&PROGRESS_LINE, line).unwrap_or(0);
        record.edges_found = capture(&COV, line).unwrap_or(0);
        record.coverage = record.edges_found as f64;
        record.corpus_count = capture(&CORP, line).unwrap_or(0);
        record.execs_per_sec = capture::<u64>(&EXEC_SPEED, line).unwrap_or(0) as f64;
        record.peak_rss_mb = capture(&RSS, line).unwrap_or(0);
    }
    // final stats are more precise than the last progress line.
    record.apply_lines(&LIBFUZZER_KEYS, content.lines().filter(|l| l.starts_with("stat::")));

    for line in content.lines() {
        if line.starts_with("ALARM: working on the last Unit") {
            record.unique_hangs += 1;
        } else if line.contains("ERROR: libFuzzer: out-of-memory") {
            record.ooms += 1;
        } else if line.contains("ERROR: libFuzzer: deadly signal") || line.contains("ERROR: AddressSanitizer") {
            record.unique_crashes += 1;
        }
    }
    record
}

/// Feature count of the `INITED` line, used for single-input coverage runs.
pub fn parse_libfuzzer_features(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.contains("INITED"))?;
    let cov = capture(&COV, line)?;
    let ft = capture(&FT, line).unwrap_or(0);
    Some((cov, ft))
}

fn capture<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}
