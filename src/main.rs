use anyhow::Context;
use fuzzvisor::{
    config::{load_markers, Config},
    FuzzingTask, Orchestrator,
};
use serde::Serialize;
use simplelog::LevelFilter;
use std::{
    collections::BTreeMap,
    fs::write,
    os::raw::c_int,
    path::PathBuf,
    sync::Arc,
};
use structopt::StructOpt;
use tokio::runtime::{Builder, Handle};

#[derive(Debug, StructOpt)]
#[structopt(name = "fuzzvisor", about = "Supervise AFL and libFuzzer sessions.")]
struct Settings {
    /// Root directory of session directories, default is '$TMPDIR/fuzzvisor'.
    #[structopt(short, long)]
    work_dir: Option<PathBuf>,
    /// Log level: off, error, warn, info, debug or trace.
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
    /// File of crash markers used by reproduction, one per line.
    #[structopt(long)]
    crash_markers: Option<PathBuf>,
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Run one fuzzing session until it exits, times out or is interrupted.
    Fuzz {
        /// Engine to run, e.g. afl or libfuzzer.
        #[structopt(short, long, default_value = "afl")]
        engine: String,
        /// Seed file or directory.
        #[structopt(short, long)]
        corpus: Option<PathBuf>,
        /// Session time budget in seconds, 0 means unbounded.
        #[structopt(short, long, default_value = "0")]
        timeout: u64,
        /// Memory limit of the target in megabyte, 0 means unlimited.
        #[structopt(short, long, default_value = "0")]
        memory_limit: u64,
        /// Per-input execution timeout in milliseconds.
        #[structopt(long)]
        exec_timeout: Option<u64>,
        /// Dictionary file.
        #[structopt(short = "x", long)]
        dict: Option<PathBuf>,
        /// Extra engine option in key=value format, can be repeated.
        #[structopt(short = "O", long = "option", parse(try_from_str = parse_key_val))]
        options: Vec<(String, String)>,
        /// Extra environment variable of the fuzzer in key=value format, can be repeated.
        #[structopt(short = "E", long = "env", parse(try_from_str = parse_key_val))]
        env: Vec<(String, String)>,
        /// Measure coverage of the final corpus.
        #[structopt(long)]
        coverage: bool,
        /// Minimize collected crashes.
        #[structopt(long)]
        minimize: bool,
        /// Report at most this many crashes.
        #[structopt(long)]
        max_crashes: Option<usize>,
        /// Write the result to this file instead of stdout.
        #[structopt(short, long)]
        output: Option<PathBuf>,
        /// Path to the target.
        target: PathBuf,
        /// Target arguments, '@@' marks the input file.
        #[structopt(last = true)]
        args: Vec<String>,
    },
    /// Run a target on one test case and classify the crash.
    Repro {
        #[structopt(short, long, default_value = "afl")]
        engine: String,
        testcase: PathBuf,
        target: PathBuf,
        #[structopt(last = true)]
        args: Vec<String>,
    },
    /// Minimize a crashing test case.
    Minimize {
        #[structopt(short, long, default_value = "afl")]
        engine: String,
        testcase: PathBuf,
        target: PathBuf,
        #[structopt(last = true)]
        args: Vec<String>,
    },
    /// Measure coverage of an input or a corpus directory.
    Coverage {
        #[structopt(short, long, default_value = "libfuzzer")]
        engine: String,
        corpus: PathBuf,
        target: PathBuf,
        #[structopt(last = true)]
        args: Vec<String>,
    },
    /// List registered engines.
    Engines,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, found '{}'", s))?;
    if k.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((k.to_string(), v.to_string()))
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();
    simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        settings.log_level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )])
    .context("failed to init logger")?;

    let mut config = Config::default();
    if let Some(dir) = settings.work_dir {
        config.work_dir = dir;
    }
    if let Some(path) = settings.crash_markers.as_ref() {
        config.crash_markers = load_markers(path)
            .with_context(|| format!("failed to load crash markers: {}", path.display()))?;
    }
    config.check().context("config error")?;

    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name("fuzzvisor-worker")
        .build()
        .context("failed to init tokio runtime")?;
    let orch = Arc::new(Orchestrator::with_default_engines(config));
    setup_signal_handler(rt.handle().clone(), Arc::clone(&orch))?;

    rt.block_on(run(settings.cmd, orch))
}

async fn run(cmd: Cmd, orch: Arc<Orchestrator>) -> anyhow::Result<()> {
    match cmd {
        Cmd::Fuzz {
            engine,
            corpus,
            timeout,
            memory_limit,
            exec_timeout,
            dict,
            options,
            env,
            coverage,
            minimize,
            max_crashes,
            output,
            target,
            args,
        } => {
            let task = FuzzingTask {
                args,
                corpus,
                timeout_secs: timeout,
                memory_limit_mb: memory_limit,
                exec_timeout_ms: exec_timeout,
                dictionary: dict,
                options: options.into_iter().collect::<BTreeMap<_, _>>(),
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                collect_coverage: coverage,
                minimize_crashes: minimize,
                max_crashes,
                ..FuzzingTask::new(engine, target)
            };
            let handle = orch.start_fuzzing(task).await?;
            log::info!("session {} running, pid {}", handle.id(), handle.pid());
            let result = handle.await?;
            if orch.is_shutdown() {
                log::info!("session {} interrupted", result.session_id);
            }
            emit(&result, output)
        }
        Cmd::Repro {
            engine,
            testcase,
            target,
            args,
        } => {
            let result = orch.reproduce_crash(&engine, &testcase, &target, &args).await?;
            emit(&result, None)
        }
        Cmd::Minimize {
            engine,
            testcase,
            target,
            args,
        } => {
            let out = orch
                .minimize_test_case(&engine, &testcase, &target, &args)
                .await?;
            println!("{}", out.display());
            Ok(())
        }
        Cmd::Coverage {
            engine,
            corpus,
            target,
            args,
        } => {
            let cov = orch.generate_coverage(&engine, &corpus, &target, &args).await?;
            emit(&cov, None)
        }
        Cmd::Engines => emit(&orch.engines().await?, None),
    }
}

fn emit<T: Serialize>(val: &T, output: Option<PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(val).context("failed to serialize result")?;
    match output {
        Some(path) => write(&path, json)
            .with_context(|| format!("failed to write result: {}", path.display())),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

fn setup_signal_handler(rt: Handle, orch: Arc<Orchestrator>) -> anyhow::Result<()> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals =
        SignalsInfo::<WithOrigin>::new(TERM_SIGNALS).context("failed to setup signal handler")?;
    std::thread::Builder::new()
        .name("fuzzvisor-signal".into())
        .spawn(move || {
            let info = match signals.forever().next() {
                Some(info) => info,
                None => return,
            };
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!("{} recved, from: {}", named_signal(info.signal), from);
            println!("please waiting sessions to exit...");
            rt.block_on(orch.shutdown());
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}
