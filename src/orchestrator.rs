//! Single entry point: engine registry plus the session registry shared by all adapters.

use crate::{
    adapter::{EngineAdapter, SessionHandle},
    config::Config,
    engine::{
        afl::AflEngine,
        libfuzzer::LibFuzzerEngine,
        Engine, EngineError,
    },
    result::{CoverageInfo, ReproductionResult, SessionStatus},
    session::{SessionInfo, SessionRegistry},
    task::FuzzingTask,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// What an engine offers, as reported by `Orchestrator::engines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
    pub platforms: Vec<String>,
    pub formats: Vec<String>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    sessions: SessionRegistry,
    adapters: FxHashMap<String, Arc<EngineAdapter>>,
}

impl Orchestrator {
    /// Orchestrator without any engine.
    pub fn new(config: Config) -> Self {
        Self {
            sessions: SessionRegistry::with_retention(config.retained_sessions),
            config: Arc::new(config),
            adapters: FxHashMap::default(),
        }
    }

    /// Orchestrator with AFL and libFuzzer registered.
    pub fn with_default_engines(config: Config) -> Self {
        let mut orch = Self::new(config);
        let afl = AflEngine::new(orch.config.afl.clone());
        let libfuzzer = LibFuzzerEngine::new(orch.config.libfuzzer.clone());
        orch.register(Arc::new(afl));
        orch.register(Arc::new(libfuzzer));
        orch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers `engine` under its name, replacing any engine of the same name.
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        let name = engine.name().to_string();
        let adapter = EngineAdapter::new(engine, Arc::clone(&self.config), self.sessions.clone());
        if self.adapters.insert(name.clone(), Arc::new(adapter)).is_some() {
            log::warn!("engine '{}' replaced", name);
        } else {
            log::debug!("engine '{}' registered", name);
        }
    }

    pub fn resolve(&self, engine: &str) -> Result<&Arc<EngineAdapter>, EngineError> {
        self.adapters
            .get(engine)
            .ok_or_else(|| EngineError::UnknownEngine(engine.to_string()))
    }

    /// Registered engine names, sorted.
    pub fn engine_names(&self) -> Vec<String> {
        let mut names = self.adapters.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Info of every engine, sorted by name. Runs each tool for its version.
    pub async fn engines(&self) -> Result<Vec<EngineInfo>, EngineError> {
        let adapters = self
            .engine_names()
            .into_iter()
            .filter_map(|name| self.adapters.get(&name).cloned())
            .collect::<Vec<_>>();
        tokio::task::spawn_blocking(move || {
            adapters
                .iter()
                .map(|a| {
                    let engine = a.engine();
                    EngineInfo {
                        name: engine.name().to_string(),
                        available: engine.is_available(),
                        version: engine.version(),
                        platforms: to_strings(engine.supported_platforms()),
                        formats: to_strings(engine.supported_formats()),
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| EngineError::Monitor(e.to_string()))
    }

    pub async fn start_fuzzing(&self, task: FuzzingTask) -> Result<SessionHandle, EngineError> {
        let adapter = self.resolve(&task.engine)?;
        adapter.start(task).await
    }

    /// Stops a session of any engine. No-op for unknown or finished sessions.
    pub async fn stop_fuzzing(&self, session_id: &str) {
        self.sessions.stop(session_id).await
    }

    pub fn fuzzing_status(&self, session_id: &str) -> SessionStatus {
        self.sessions.status(session_id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    pub async fn minimize_test_case(
        &self,
        engine: &str,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<PathBuf, EngineError> {
        self.resolve(engine)?.minimize(testcase, target, args).await
    }

    pub async fn reproduce_crash(
        &self,
        engine: &str,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<ReproductionResult, EngineError> {
        self.resolve(engine)?.reproduce(testcase, target, args).await
    }

    pub async fn generate_coverage(
        &self,
        engine: &str,
        corpus: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<CoverageInfo, EngineError> {
        self.resolve(engine)?.coverage(corpus, target, args).await
    }

    pub fn supported_platforms(&self, engine: &str) -> Result<Vec<String>, EngineError> {
        Ok(to_strings(self.resolve(engine)?.engine().supported_platforms()))
    }

    pub fn supported_formats(&self, engine: &str) -> Result<Vec<String>, EngineError> {
        Ok(to_strings(self.resolve(engine)?.engine().supported_formats()))
    }

    pub fn is_available(&self, engine: &str) -> Result<bool, EngineError> {
        Ok(self.resolve(engine)?.engine().is_available())
    }

    pub async fn version(&self, engine: &str) -> Result<Option<String>, EngineError> {
        let adapter = Arc::clone(self.resolve(engine)?);
        tokio::task::spawn_blocking(move || adapter.engine().version())
            .await
            .map_err(|e| EngineError::Monitor(e.to_string()))
    }

    /// Kills running helpers, stops every session and refuses new work.
    pub async fn shutdown(&self) {
        self.sessions.shutdown();
        self.cleanup().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.sessions.is_shutdown()
    }

    /// Stops every running session of every engine.
    pub async fn cleanup(&self) {
        for name in self.engine_names() {
            if let Some(adapter) = self.adapters.get(&name) {
                adapter.cleanup().await;
            }
        }
    }
}

fn to_strings(s: &[&str]) -> Vec<String> {
    s.iter().map(|s| s.to_string()).collect()
}
