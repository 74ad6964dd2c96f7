//! Session lifecycle shared by all engines: spawn, monitor, stop and the helper runs.

use crate::{
    config::Config,
    engine::{
        repro::{self, CrashClassifier},
        Engine, EngineError,
    },
    result::{CoverageInfo, FuzzingResult, ReproductionResult, ResultAssembler, SessionStatus},
    session::{SessionLayout, SessionRegistry},
    task::FuzzingTask,
    utils::{
        absolute,
        process::{ProcessHandle, ProcessSpec, WaitOutcome},
    },
};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    fs,
    sync::oneshot,
    task::{JoinError, JoinHandle},
};

/// Drives one engine. Every session it starts is tracked in the shared registry.
pub struct EngineAdapter {
    engine: Arc<dyn Engine>,
    config: Arc<Config>,
    classifier: CrashClassifier,
    sessions: SessionRegistry,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn Engine>, config: Arc<Config>, sessions: SessionRegistry) -> Self {
        let classifier = config.classifier();
        Self {
            engine,
            config,
            classifier,
            sessions,
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        &*self.engine
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Prepares the session directory and spawns the fuzzer. Returns once the process runs,
    /// monitoring continues in the background.
    pub async fn start(&self, task: FuzzingTask) -> Result<SessionHandle, EngineError> {
        if self.sessions.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        let task = task.absolute()?;
        task.check()?;
        let id = self.sessions.next_id(self.name());
        let work_dir = match task.work_dir.as_ref() {
            Some(dir) => dir.clone(),
            None => absolute(&self.config.work_dir)?,
        };
        let layout = SessionLayout::new(work_dir, &id);
        layout.create().await?;

        let process = match self.launch(&id, &task, &layout).await {
            Ok(p) => p,
            Err(e) => {
                session_warn!(id, "failed to start: {}", e);
                if let Err(e) = layout.remove().await {
                    session_warn!(id, "failed to remove {}: {}", layout.root().display(), e);
                }
                return Err(e);
            }
        };
        let pid = process.pid();
        let stop_rx = self.sessions.register(&id, self.name(), pid);
        session_info!(
            id,
            "{} started on {} (pid {}, timeout {}s)",
            self.name(),
            task.target.display(),
            pid,
            task.timeout_secs
        );

        let monitor = Monitor {
            id: id.clone(),
            engine: Arc::clone(&self.engine),
            config: Arc::clone(&self.config),
            sessions: self.sessions.clone(),
            layout,
            task,
            start_time: Utc::now(),
        };
        let join = tokio::spawn(monitor.run(process, stop_rx));
        Ok(SessionHandle { id, pid, join })
    }

    async fn launch(
        &self,
        id: &str,
        task: &FuzzingTask,
        layout: &SessionLayout,
    ) -> Result<ProcessHandle, EngineError> {
        let seeds = layout.seed(task.corpus.as_deref()).await?;
        self.engine.prepare(layout)?;
        let spec = self.engine.fuzz_command(task, layout);
        session_debug!(id, "{} seed(s), command: {}", seeds, spec);
        Ok(ProcessHandle::spawn(&spec)?)
    }

    /// Stops a running session and waits until it is terminal. No-op for other ids.
    pub async fn stop(&self, session_id: &str) {
        self.sessions.stop(session_id).await
    }

    pub fn status(&self, session_id: &str) -> SessionStatus {
        self.sessions.status(session_id)
    }

    /// Minimizes `testcase` in a fresh directory under the work dir. The directory is kept on
    /// success and holds the returned file.
    pub async fn minimize(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<PathBuf, EngineError> {
        if !testcase.is_file() {
            return Err(EngineError::Minimization(format!(
                "test case not found: {}",
                testcase.display()
            )));
        }
        fs::create_dir_all(&self.config.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("minimize-")
            .tempdir_in(&self.config.work_dir)?;
        let name = testcase
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "testcase".into());
        let out = dir.path().join(&name);
        minimize_into(
            &*self.engine,
            &self.sessions,
            self.config.minimize_timeout,
            testcase,
            target,
            args,
            &out,
        )
        .await?;
        Ok(dir.keep().join(name))
    }

    pub async fn reproduce(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<ReproductionResult, EngineError> {
        repro::reproduce(
            &self.classifier,
            testcase,
            target,
            args,
            self.config.repro_timeout,
            self.sessions.shutdown_requested(),
        )
        .await
    }

    /// Coverage reached by `corpus`, a single input or a directory of inputs. Zero-valued if the
    /// engine has no coverage path.
    pub async fn coverage(
        &self,
        corpus: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<CoverageInfo, EngineError> {
        if !self.engine.has_coverage() {
            log::debug!("{}: no coverage support, reporting zero", self.name());
            return Ok(CoverageInfo::default());
        }
        if corpus.is_dir() {
            return coverage_of(
                &*self.engine,
                &self.sessions,
                self.config.coverage_timeout,
                corpus,
                target,
                args,
            )
            .await;
        }
        if !corpus.is_file() {
            return Err(EngineError::Coverage(format!(
                "input not found: {}",
                corpus.display()
            )));
        }
        // the engine takes corpus directories only.
        fs::create_dir_all(&self.config.work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("coverage-")
            .tempdir_in(&self.config.work_dir)?;
        let name = corpus
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "input".into());
        fs::copy(corpus, dir.path().join(name)).await?;
        coverage_of(
            &*self.engine,
            &self.sessions,
            self.config.coverage_timeout,
            dir.path(),
            target,
            args,
        )
        .await
    }

    /// Stops every running session of this engine and forgets all of them.
    pub async fn cleanup(&self) {
        let running = self.sessions.running(Some(self.name()));
        if !running.is_empty() {
            log::info!("{}: stopping {} session(s)", self.name(), running.len());
        }
        for id in running {
            self.sessions.stop(&id).await;
        }
        self.sessions.clear(self.name());
    }
}

/// Handle of a started session, resolves to its result once monitoring is done.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    pid: u32,
    join: JoinHandle<Result<FuzzingResult, EngineError>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Future for SessionHandle {
    type Output = Result<FuzzingResult, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.join)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|e: JoinError| Err(EngineError::Monitor(e.to_string()))))
    }
}

/// Moves the session to ERROR if the monitor ends without finishing it.
struct FinishGuard {
    sessions: SessionRegistry,
    id: String,
    armed: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.armed && self.sessions.finish(&self.id, SessionStatus::Error) {
            session_warn!(self.id, "monitor ended unexpectedly");
        }
    }
}

struct Monitor {
    id: String,
    engine: Arc<dyn Engine>,
    config: Arc<Config>,
    sessions: SessionRegistry,
    layout: SessionLayout,
    task: FuzzingTask,
    start_time: DateTime<Utc>,
}

impl Monitor {
    async fn run(
        self,
        mut process: ProcessHandle,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Result<FuzzingResult, EngineError> {
        let mut guard = FinishGuard {
            sessions: self.sessions.clone(),
            id: self.id.clone(),
            armed: true,
        };
        let timeout = self.task.timeout();
        let deadline = async {
            match timeout {
                Some(du) => tokio::time::sleep(du).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut error = None;
        let mut status = tokio::select! {
            r = process.wait() => match r {
                Ok(_) => SessionStatus::Completed,
                Err(e) => {
                    error = Some(format!("failed to wait for fuzzer: {}", e));
                    SessionStatus::Error
                }
            },
            _ = &mut deadline => {
                error = Some(format!("timed out after {}s", self.task.timeout_secs));
                SessionStatus::Timeout
            }
            Ok(()) = &mut stop_rx => SessionStatus::Stopped,
            _ = self.sessions.shutdown_requested() => SessionStatus::Stopped,
        };
        if let Err(e) = process.terminate().await {
            error = Some(format!("failed to terminate fuzzer: {}", e));
            status = SessionStatus::Error;
        }
        self.sessions.finish(&self.id, status);
        guard.armed = false;
        let exit_code = process.exit_code();
        session_info!(self.id, "{}, exit code {:?}", status, exit_code);

        let output = process.finish_output().await;
        drop(process);
        if let Err(e) = fs::write(self.layout.log_file(), &output).await {
            session_warn!(self.id, "failed to save fuzzer output: {}", e);
        }

        let mut assembler = ResultAssembler::new(&self.id, self.engine.name(), self.start_time);
        assembler.exit(status, exit_code);
        if let Some(e) = error {
            assembler.error(e);
        }
        let engine = Arc::clone(&self.engine);
        let layout = self.layout.clone();
        let collected = tokio::task::spawn_blocking(move || {
            let stats = engine.stats(&layout);
            (stats, engine.crashes(&layout), engine.final_corpus(&layout))
        })
        .await;
        let corpus = match collected {
            Ok((stats, crashes, corpus)) => {
                assembler
                    .stats(stats)
                    .crashes(crashes, self.task.max_crashes)
                    .final_corpus(corpus.clone());
                Some(corpus)
            }
            Err(e) => {
                session_warn!(self.id, "failed to collect results: {}", e);
                assembler.error(format!("failed to collect results: {}", e));
                None
            }
        };

        if self.task.minimize_crashes && !assembler.crash_files().is_empty() {
            let minimized = self.minimize_crashes(assembler.crash_files()).await;
            assembler.minimized(minimized);
        }
        if let (true, Some(corpus)) = (self.task.collect_coverage, corpus) {
            match coverage_of(
                &*self.engine,
                &self.sessions,
                self.config.coverage_timeout,
                &corpus,
                &self.task.target,
                &self.task.args,
            )
            .await
            {
                Ok(cov) => {
                    assembler.coverage(cov);
                }
                Err(e) => session_warn!(self.id, "coverage: {}", e),
            }
        }

        let result = assembler.finish();
        session_info!(
            self.id,
            "done: {} execs, {} crash(es), successful: {}",
            result.execution_count,
            result.crash_count,
            result.successful
        );
        Ok(result)
    }

    async fn minimize_crashes(&self, crashes: &[PathBuf]) -> Vec<PathBuf> {
        let dir = self.layout.output_dir().join("minimized");
        if let Err(e) = fs::create_dir_all(&dir).await {
            session_warn!(self.id, "failed to create {}: {}", dir.display(), e);
            return Vec::new();
        }
        let mut ret = Vec::new();
        for crash in crashes {
            let out = match crash.file_name() {
                Some(name) => dir.join(name),
                None => continue,
            };
            match minimize_into(
                &*self.engine,
                &self.sessions,
                self.config.minimize_timeout,
                crash,
                &self.task.target,
                &self.task.args,
                &out,
            )
            .await
            {
                Ok(()) => ret.push(out),
                Err(EngineError::Shutdown) => break,
                Err(e) => session_warn!(self.id, "{}: {}", crash.display(), e),
            }
        }
        ret
    }
}

/// Runs `spec` to the end, at most `timeout`. Returns the exit code and combined output, `None`
/// on timeout. The helper is killed once the registry shuts down.
async fn run_helper(
    spec: &ProcessSpec,
    sessions: &SessionRegistry,
    timeout: Duration,
) -> Result<Option<(i32, String)>, EngineError> {
    let mut p = ProcessHandle::spawn(spec)?;
    let outcome = tokio::select! {
        r = p.wait_timeout(Some(timeout)) => Some(r?),
        _ = sessions.shutdown_requested() => None,
    };
    let code = match outcome {
        Some(WaitOutcome::Exited(code)) => code,
        Some(WaitOutcome::TimedOut) => {
            p.terminate().await?;
            return Ok(None);
        }
        None => {
            p.terminate().await?;
            return Err(EngineError::Shutdown);
        }
    };
    let output = String::from_utf8_lossy(&p.finish_output().await).into_owned();
    Ok(Some((code, output)))
}

async fn minimize_into(
    engine: &dyn Engine,
    sessions: &SessionRegistry,
    timeout: Duration,
    testcase: &Path,
    target: &Path,
    args: &[String],
    out: &Path,
) -> Result<(), EngineError> {
    let spec = engine.minimize_command(testcase, target, args, out);
    log::debug!("{}: minimizing {}: {}", engine.name(), testcase.display(), spec);
    match run_helper(&spec, sessions, timeout).await? {
        None => Err(EngineError::Minimization(format!(
            "timed out after {}s",
            timeout.as_secs()
        ))),
        Some((code, output)) if code != 0 => Err(EngineError::Minimization(format!(
            "exited with {}: {}",
            code,
            last_line(&output)
        ))),
        Some(_) if !out.is_file() => Err(EngineError::Minimization(format!(
            "no output at {}",
            out.display()
        ))),
        Some(_) => Ok(()),
    }
}

async fn coverage_of(
    engine: &dyn Engine,
    sessions: &SessionRegistry,
    timeout: Duration,
    corpus_dir: &Path,
    target: &Path,
    args: &[String],
) -> Result<CoverageInfo, EngineError> {
    let spec = match engine.coverage_command(corpus_dir, target, args) {
        Some(spec) => spec,
        None => return Ok(CoverageInfo::default()),
    };
    log::debug!("{}: coverage of {}: {}", engine.name(), corpus_dir.display(), spec);
    let (code, output) = run_helper(&spec, sessions, timeout).await?.ok_or_else(|| {
        EngineError::Coverage(format!("timed out after {}s", timeout.as_secs()))
    })?;
    match engine.parse_coverage(&output) {
        Some(cov) => Ok(cov),
        None if code == 0 => Ok(CoverageInfo::default()),
        None => Err(EngineError::Coverage(format!(
            "exited with {}: {}",
            code,
            last_line(&output)
        ))),
    }
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        afl::{AflConfig, AflEngine},
        libfuzzer::{LibFuzzerConfig, LibFuzzerEngine},
        testing::DirectEngine,
    };
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
    use rustc_hash::FxHashSet;
    use std::{
        fs::{read_dir, set_permissions, write, Permissions},
        os::unix::fs::PermissionsExt,
        time::Instant,
    };
    use tempfile::TempDir;

    fn adapter(work_dir: &Path) -> EngineAdapter {
        let config = Config {
            work_dir: work_dir.to_path_buf(),
            ..Config::default()
        };
        EngineAdapter::new(
            Arc::new(DirectEngine::new()),
            Arc::new(config),
            SessionRegistry::new(),
        )
    }

    fn task(target: &str, timeout_secs: u64) -> FuzzingTask {
        FuzzingTask {
            timeout_secs,
            ..FuzzingTask::new("direct", target)
        }
    }

    fn sh_task(script: &str, timeout_secs: u64) -> FuzzingTask {
        FuzzingTask {
            args: vec!["-c".to_string(), script.to_string(), "@@".to_string()],
            ..task("/bin/sh", timeout_secs)
        }
    }

    fn gone(pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH)
    }

    /// Executable shell script standing in for a fuzzing tool.
    fn stand_in(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Directory under the current directory, with its path relative to it.
    fn relative_tempdir() -> (TempDir, PathBuf) {
        let dir = tempfile::Builder::new()
            .prefix("fuzzvisor-test-")
            .tempdir_in(".")
            .unwrap();
        let rel = PathBuf::from(dir.path().file_name().unwrap());
        assert!(rel.is_relative());
        (dir, rel)
    }

    const AFL_FUZZ: &str = r#"
[ -d "$2" ] || { echo "no input dir $2" >&2; exit 42; }
case "$8" in /*) ;; *) echo "relative target $8" >&2; exit 43 ;; esac
mkdir -p "$4/default/queue" "$4/default/crashes"
cp "$2"/* "$4/default/queue/"
printf 'execs_done        : 1234\ncorpus_count      : 3\nbitmap_cvg        : 5.50%%\n' > "$4/default/fuzzer_stats"
echo crash > "$4/default/crashes/id:000000,sig:11"
echo notes > "$4/default/crashes/README.txt"
"#;

    const LIBFUZZER_TARGET: &str = r#"
for a in "$@"; do
    case "$a" in
        -artifact_prefix=*) prefix="${a#-artifact_prefix=}" ;;
        -*) ;;
        *) queue="$input"; input="$a" ;;
    esac
done
[ -d "$prefix" ] && [ -d "$queue" ] && [ -d "$input" ] || { echo "bad dirs: $prefix $queue $input" >&2; exit 42; }
cp "$input"/* "$queue"/
printf '#2\tINITED cov: 10 ft: 12 corp: 1/4b exec/s: 0 rss: 30Mb\n' >&2
printf '#512\tNEW    cov: 20 ft: 30 corp: 4/20b lim: 4 exec/s: 256 rss: 31Mb\n' >&2
echo crash > "${prefix}crash-abc"
echo leak > "${prefix}leak-def"
echo slow > "${prefix}timeout-123"
echo '==1==ERROR: libFuzzer: deadly signal' >&2
echo 'stat::number_of_executed_units: 600' >&2
echo 'stat::peak_rss_mb: 31' >&2
exit 1
"#;

    #[tokio::test]
    async fn true_completes() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let h = a.start(task("/bin/true", 5)).await.unwrap();
        let id = h.id().to_string();
        let r = h.await.unwrap();
        assert_eq!(r.status, SessionStatus::Completed);
        assert!(r.successful);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.crash_count, 0);
        assert_eq!(r.session_id, id);
        assert!(dir.path().join(&id).join("input").join("seed").is_file());
        assert!(dir.path().join(&id).join("output").join("fuzzer.log").is_file());

        assert_eq!(a.status(&id), SessionStatus::Completed);
        assert_eq!(a.status(&id), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn false_keeps_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let r = a.start(task("/bin/false", 5)).await.unwrap().await.unwrap();
        assert_eq!(r.status, SessionStatus::Completed);
        assert!(!r.successful);
        assert_eq!(r.exit_code, 1);
        assert_eq!(r.error_message, None);
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let now = Instant::now();
        let h = a.start(sh_task("sleep 30", 1)).await.unwrap();
        let (id, pid) = (h.id().to_string(), h.pid());
        let r = h.await.unwrap();
        assert_eq!(r.status, SessionStatus::Timeout);
        assert!(!r.successful);
        assert!(r.error_message.is_some());
        assert!(now.elapsed() < Duration::from_secs(10));
        assert!(gone(pid));
        assert_eq!(a.status(&id), SessionStatus::Timeout);
    }

    #[tokio::test]
    async fn stop_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let h = a.start(sh_task("sleep 30", 0)).await.unwrap();
        let (id, pid) = (h.id().to_string(), h.pid());
        assert_eq!(a.sessions.peek(&id), SessionStatus::Running);

        a.stop(&id).await;
        assert_eq!(a.sessions.peek(&id), SessionStatus::Stopped);
        let r = h.await.unwrap();
        assert_eq!(r.status, SessionStatus::Stopped);
        assert!(gone(pid));

        // terminal and unknown sessions.
        a.stop(&id).await;
        a.stop("direct-999-00000000").await;
        assert_eq!(a.status(&id), SessionStatus::Stopped);
        assert_eq!(a.status("direct-999-00000000"), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn stop_racing_natural_exit() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        for _ in 0..10 {
            let h = a.start(task("/bin/true", 0)).await.unwrap();
            let id = h.id().to_string();
            a.stop(&id).await;
            let r = h.await.unwrap();
            assert!(matches!(
                r.status,
                SessionStatus::Completed | SessionStatus::Stopped
            ));
            assert_eq!(a.status(&id), r.status);
            assert_eq!(a.status(&id), SessionStatus::Unknown);
        }
    }

    #[tokio::test]
    async fn spawn_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not-executable");
        write(&target, "data").unwrap();
        let work = dir.path().join("work");
        let a = adapter(&work);
        let err = a.start(task(target.to_str().unwrap(), 5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn(_)));
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
        assert!(a.sessions.list().is_empty());
    }

    #[tokio::test]
    async fn crashes_collected_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let script = "mkdir -p output/crashes && for i in 1 2 3 4; do echo $i > output/crashes/id:00000$i; done; touch output/crashes/README.txt";
        let t = FuzzingTask {
            max_crashes: Some(3),
            minimize_crashes: true,
            ..sh_task(script, 5)
        };
        let r = a.start(t).await.unwrap().await.unwrap();
        assert_eq!(r.crash_count, 3);
        assert_eq!(r.crash_count, r.crash_files.len());
        assert!(r.crash_files[0].ends_with("id:000001"));
        assert_eq!(r.minimized_crashes.len(), 3);
        assert!(r.minimized_crashes.iter().all(|p| p.is_file()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(adapter(dir.path()));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let a = Arc::clone(&a);
            handles.push(tokio::spawn(async move {
                a.start(task("/bin/true", 10)).await.unwrap().await.unwrap()
            }));
        }
        let mut ids = FxHashSet::default();
        for h in handles {
            let r = h.await.unwrap();
            assert_eq!(r.status, SessionStatus::Completed);
            assert!(dir.path().join(&r.session_id).is_dir());
            ids.insert(r.session_id);
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 50);
        for id in &ids {
            assert_eq!(a.status(id), SessionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn cleanup_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let h1 = a.start(sh_task("sleep 30", 0)).await.unwrap();
        let h2 = a.start(sh_task("sleep 30", 0)).await.unwrap();
        let pids = [h1.pid(), h2.pid()];
        a.cleanup().await;
        assert_eq!(h1.await.unwrap().status, SessionStatus::Stopped);
        assert_eq!(h2.await.unwrap().status, SessionStatus::Stopped);
        assert!(pids.iter().all(|p| gone(*p)));
        assert!(a.sessions.list().is_empty());
    }

    #[tokio::test]
    async fn minimize_case() {
        let dir = tempfile::tempdir().unwrap();
        let case = dir.path().join("crash-1");
        write(&case, "abcd").unwrap();
        let a = adapter(&dir.path().join("work"));
        let out = a.minimize(&case, Path::new("/bin/true"), &[]).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"abc");
        assert!(out.parent().unwrap().starts_with(dir.path().join("work")));

        let err = a
            .minimize(Path::new("/nonexistent"), Path::new("/bin/true"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Minimization(_)));
    }

    #[tokio::test]
    async fn minimize_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let case = dir.path().join("crash-1");
        write(&case, "abcd").unwrap();
        let config = Config {
            work_dir: dir.path().join("work"),
            afl: AflConfig {
                afl_tmin: PathBuf::from("/bin/false"),
                ..AflConfig::default()
            },
            ..Config::default()
        };
        let a = EngineAdapter::new(
            Arc::new(AflEngine::new(config.afl.clone())),
            Arc::new(config),
            SessionRegistry::new(),
        );
        let err = a.minimize(&case, Path::new("/bin/true"), &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Minimization(_)));
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reproduce_through_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let case = dir.path().join("crash-1");
        write(&case, "x").unwrap();
        let a = adapter(dir.path());
        let args = vec![
            "-c".to_string(),
            "echo AddressSanitizer; exit 1".to_string(),
            "@@".to_string(),
        ];
        let r = a.reproduce(&case, Path::new("/bin/sh"), &args).await.unwrap();
        assert!(r.reproduced);
        assert_eq!(r.crash_type.as_deref(), Some("AddressSanitizer"));
    }

    #[tokio::test]
    async fn coverage_gap_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path());
        let cov = a
            .coverage(dir.path(), Path::new("/bin/true"), &[])
            .await
            .unwrap();
        assert_eq!(cov, CoverageInfo::default());
    }

    #[tokio::test]
    async fn afl_session_with_relative_paths() {
        let (_dir, rel) = relative_tempdir();
        let afl_fuzz = stand_in(&rel, "afl-fuzz", AFL_FUZZ);
        let target = stand_in(&rel, "target", "exit 0");
        let config = Config {
            work_dir: rel.join("work"),
            afl: AflConfig {
                afl_fuzz,
                ..AflConfig::default()
            },
            ..Config::default()
        };
        let a = EngineAdapter::new(
            Arc::new(AflEngine::new(config.afl.clone())),
            Arc::new(config),
            SessionRegistry::new(),
        );
        let h = a.start(FuzzingTask::new("afl", &target)).await.unwrap();
        let id = h.id().to_string();
        let r = h.await.unwrap();

        let root = absolute(rel.join("work").join(&id)).unwrap();
        let log = std::fs::read_to_string(root.join("output").join("fuzzer.log")).unwrap();
        assert_eq!(r.exit_code, 0, "fuzzer output: {}", log);
        assert_eq!(r.status, SessionStatus::Completed);
        assert!(r.successful);
        assert_eq!(r.execution_count, 1234);
        assert_eq!(r.statistics.corpus_size, 3);
        assert!((r.coverage - 5.5).abs() < f64::EPSILON);
        assert_eq!(r.crash_count, 1);
        assert_eq!(r.crash_files[0], root.join("output/default/crashes/id:000000,sig:11"));
        assert_eq!(r.final_corpus, root.join("output/default/queue"));
        assert!(r.final_corpus.join("seed").is_file());
    }

    #[tokio::test]
    async fn libfuzzer_session_collects_artifacts() {
        let (_dir, rel) = relative_tempdir();
        let target = stand_in(&rel, "fuzz_target", LIBFUZZER_TARGET);
        let config = Config {
            work_dir: rel.join("work"),
            ..Config::default()
        };
        let a = EngineAdapter::new(
            Arc::new(LibFuzzerEngine::new(LibFuzzerConfig::default())),
            Arc::new(config),
            SessionRegistry::new(),
        );
        let r = a
            .start(FuzzingTask::new("libfuzzer", &target))
            .await
            .unwrap()
            .await
            .unwrap();

        assert_eq!(r.status, SessionStatus::Completed);
        assert_eq!(r.exit_code, 1);
        assert!(!r.successful);
        assert_eq!(r.execution_count, 600);
        assert!((r.coverage - 20.0).abs() < f64::EPSILON);
        assert_eq!(r.statistics.peak_memory_mb, 31);
        assert_eq!(r.statistics.corpus_size, 4);
        let names = r
            .crash_files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["crash-abc", "leak-def"]);
        assert_eq!(r.crash_count, 2);
        assert!(r.crash_files.iter().all(|p| p.is_absolute() && p.is_file()));
        assert!(r.final_corpus.ends_with("output/queue"));
        assert!(r.final_corpus.join("seed").is_file());
    }

    #[tokio::test]
    async fn shutdown_kills_helper() {
        let dir = tempfile::tempdir().unwrap();
        let case = dir.path().join("crash-1");
        write(&case, "abcd").unwrap();
        let afl_tmin = stand_in(dir.path(), "afl-tmin", "exec sleep 30");
        let work = dir.path().join("work");
        let config = Config {
            work_dir: work.clone(),
            afl: AflConfig {
                afl_tmin,
                ..AflConfig::default()
            },
            ..Config::default()
        };
        let a = Arc::new(EngineAdapter::new(
            Arc::new(AflEngine::new(config.afl.clone())),
            Arc::new(config),
            SessionRegistry::new(),
        ));

        let now = Instant::now();
        let a1 = Arc::clone(&a);
        let minimize =
            tokio::spawn(async move { a1.minimize(&case, Path::new("/bin/true"), &[]).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        a.sessions.shutdown();
        let err = tokio::time::timeout(Duration::from_secs(10), minimize)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
        assert!(now.elapsed() < Duration::from_secs(10));
        assert_eq!(read_dir(&work).unwrap().count(), 0);

        let err = a.start(task("/bin/true", 5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
    }

    #[tokio::test]
    async fn finished_sessions_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let a = EngineAdapter::new(
            Arc::new(DirectEngine::new()),
            Arc::new(config),
            SessionRegistry::with_retention(4),
        );
        for _ in 0..10 {
            a.start(task("/bin/true", 5)).await.unwrap().await.unwrap();
        }
        let h = a.start(sh_task("sleep 30", 0)).await.unwrap();
        let id = h.id().to_string();
        a.stop(&id).await;
        assert_eq!(h.await.unwrap().status, SessionStatus::Stopped);

        assert_eq!(a.sessions.list().len(), 4);
        assert_eq!(a.status(&id), SessionStatus::Stopped);
    }
}
