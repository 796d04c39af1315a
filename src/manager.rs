// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The profiler lifecycle manager.
//!
//! A [`ProfilerManager`] owns the registered backends and keeps one coherent
//! running state across them:
//!
//! ```text
//! Uninitialized --init--> Initializing --ok--> Running --stop--> Stopped
//!                              |
//!                              +--error--> Uninitialized
//! ```
//!
//! `init` only runs from `Uninitialized`. `Stopped` is terminal:
//! [`ProfilerManager::stop`] cancels the lifecycle token, and afterwards
//! `init`, `start` and `add_profiler` fail with [`ManagerError::Terminated`].
//! `stop` itself can be repeated, and still drains the backends after the
//! lifecycle token was cancelled from outside.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{self, AtomicBool},
        Arc, OnceLock,
    },
};

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::local::LocalProfiler,
    config::{BackendKind, Config, ConfigError, ProfilingState},
    context::Context,
    memory::MemoryMonitor,
    profiler::{BackendError, Operation, Profiler},
    tagging::{NoopTagger, Tagger},
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("backend {0} is not available in this build")]
    UnsupportedBackend(BackendKind),
    #[error("a profiler named {0} is already registered")]
    DuplicateProfiler(String),
    #[error("failed to {operation} profiler {name}: {source}")]
    Backend {
        name: String,
        operation: Operation,
        #[source]
        source: BackendError,
    },
    #[error("profiler manager is already initialized")]
    AlreadyInitialized,
    #[error("profiler manager has been stopped")]
    Terminated,
}

impl ManagerError {
    fn backend(name: &str, operation: Operation, source: BackendError) -> Self {
        ManagerError::Backend {
            name: name.to_owned(),
            operation,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
}

struct Inner {
    profilers: HashMap<String, Box<dyn Profiler>>,
    state: ManagerState,
}

/// Owns the registered profiler backends and fans lifecycle operations out
/// to them.
pub struct ProfilerManager {
    config: Config,
    inner: RwLock<Inner>,
    // mirrors the aggregate running state so is_running never waits on `inner`
    running: AtomicBool,
    lifecycle: CancellationToken,
    tagger: OnceLock<Arc<dyn Tagger>>,
    monitor: MemoryMonitor,
}

impl fmt::Debug for ProfilerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerManager")
            .field("application_name", &self.config.application_name)
            .field("backend", &self.config.backend)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The single mapping from a backend selector to its implementation.
fn create_profiler(config: &Config) -> Result<Box<dyn Profiler>, ManagerError> {
    match config.backend {
        #[cfg(feature = "remote-push")]
        BackendKind::RemotePush => Ok(Box::new(crate::backend::push::PushProfiler::new(
            config.clone(),
        ))),
        BackendKind::LocalSampling => Ok(Box::new(LocalProfiler::new(config.clone()))),
        #[allow(unreachable_patterns)]
        other => Err(ManagerError::UnsupportedBackend(other)),
    }
}

impl ProfilerManager {
    pub fn new(config: Config) -> Self {
        let monitor = MemoryMonitor::new(config.memory_limit_mb);
        ProfilerManager {
            config,
            inner: RwLock::new(Inner {
                profilers: HashMap::new(),
                state: ManagerState::Uninitialized,
            }),
            running: AtomicBool::new(false),
            lifecycle: CancellationToken::new(),
            tagger: OnceLock::new(),
            monitor,
        }
    }

    /// Context handed to backend operations: cancelled with the lifecycle
    /// token and bounded by the configured timeout.
    fn op_context(&self) -> Context {
        self.bounded(Context::new(self.lifecycle.clone()))
    }

    /// Context for backend stops: bounded by the timeout only, so backends
    /// can still be drained once the lifecycle token is cancelled.
    fn stop_context(&self) -> Context {
        self.bounded(Context::background())
    }

    fn bounded(&self, ctx: Context) -> Context {
        if self.config.timeout.is_zero() {
            ctx
        } else {
            ctx.with_timeout(self.config.timeout)
        }
    }

    /// Validates the configuration, creates the configured backend,
    /// registers it and, if the initial state is enabled, starts it.
    ///
    /// A backend that fails to start stays registered, and the manager is
    /// left not running. Fails without touching the manager unless it is
    /// uninitialized.
    pub async fn init(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ManagerState::Uninitialized => {}
            ManagerState::Stopped => return Err(ManagerError::Terminated),
            ManagerState::Initializing | ManagerState::Running => {
                return Err(ManagerError::AlreadyInitialized)
            }
        }
        self.config.validate()?;
        inner.state = ManagerState::Initializing;

        let profiler = match create_profiler(&self.config) {
            Ok(profiler) => profiler,
            Err(err) => {
                inner.state = ManagerState::Uninitialized;
                return Err(err);
            }
        };
        let name = profiler.name().to_owned();
        if inner.profilers.contains_key(&name) {
            inner.state = ManagerState::Uninitialized;
            return Err(ManagerError::DuplicateProfiler(name));
        }
        let _ = self.tagger.set(profiler.tagger());

        let started = match self.config.initial_state {
            ProfilingState::Enabled => profiler.start(&self.op_context()).await,
            ProfilingState::Disabled => Ok(()),
        };
        inner.profilers.insert(name.clone(), profiler);

        if let Err(err) = started {
            tracing::error!(?err, %name, "failed to start profiler");
            inner.state = ManagerState::Uninitialized;
            return Err(ManagerError::backend(&name, Operation::Start, err));
        }

        inner.state = ManagerState::Running;
        self.running.store(true, atomic::Ordering::Release);
        if self.config.memory_limit_mb > 0 {
            self.monitor.start_under(&self.lifecycle);
        }
        tracing::info!(
            application = %self.config.application_name,
            backend = %self.config.backend,
            "profiling initialized"
        );
        Ok(())
    }

    /// Registers an additional backend. While the manager is running with an
    /// enabled initial state, the backend is started right away; it stays
    /// registered even if that start fails.
    pub async fn add_profiler(&self, profiler: Box<dyn Profiler>) -> Result<(), ManagerError> {
        let mut inner = self.inner.write().await;
        if inner.state == ManagerState::Stopped {
            return Err(ManagerError::Terminated);
        }
        let name = profiler.name().to_owned();
        if inner.profilers.contains_key(&name) {
            return Err(ManagerError::DuplicateProfiler(name));
        }

        let started = if self.is_running() && self.config.initial_state == ProfilingState::Enabled
        {
            profiler.start(&self.op_context()).await
        } else {
            Ok(())
        };
        inner.profilers.insert(name.clone(), profiler);
        tracing::debug!(%name, "profiler registered");
        started.map_err(|err| ManagerError::backend(&name, Operation::Start, err))
    }

    /// Starts every registered backend, stopping at the first failure.
    /// Backends started before the failure keep running.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.write().await;
        if inner.state == ManagerState::Stopped {
            return Err(ManagerError::Terminated);
        }
        self.fan_out(&inner, Operation::Start).await?;
        if !inner.profilers.is_empty() {
            inner.state = ManagerState::Running;
            self.running.store(true, atomic::Ordering::Release);
        }
        Ok(())
    }

    /// Stops every registered backend, continuing past failures, and tears
    /// the manager down. Returns the last failure, if any.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let mut inner = self.inner.write().await;
        let ctx = self.stop_context();
        let mut last_err = None;
        for (name, profiler) in &inner.profilers {
            if let Err(err) = profiler.stop(&ctx).await {
                tracing::warn!(?err, %name, "failed to stop profiler");
                last_err = Some(ManagerError::backend(name, Operation::Stop, err));
            }
        }

        self.running.store(false, atomic::Ordering::Release);
        inner.state = ManagerState::Stopped;
        self.monitor.stop();
        self.lifecycle.cancel();
        tracing::info!("profiling stopped");
        last_err.map_or(Ok(()), Err)
    }

    /// Pauses every registered backend, stopping at the first failure.
    pub async fn pause(&self) -> Result<(), ManagerError> {
        let inner = self.inner.write().await;
        if inner.state == ManagerState::Stopped {
            return Err(ManagerError::Terminated);
        }
        self.fan_out(&inner, Operation::Pause).await?;
        self.running.store(false, atomic::Ordering::Release);
        Ok(())
    }

    /// Resumes every registered backend, stopping at the first failure.
    pub async fn resume(&self) -> Result<(), ManagerError> {
        let inner = self.inner.write().await;
        if inner.state == ManagerState::Stopped {
            return Err(ManagerError::Terminated);
        }
        self.fan_out(&inner, Operation::Resume).await?;
        if !inner.profilers.is_empty() {
            self.running.store(true, atomic::Ordering::Release);
        }
        Ok(())
    }

    async fn fan_out(&self, inner: &Inner, operation: Operation) -> Result<(), ManagerError> {
        let ctx = self.op_context();
        for (name, profiler) in &inner.profilers {
            let res = match operation {
                Operation::Start => profiler.start(&ctx).await,
                Operation::Stop => profiler.stop(&ctx).await,
                Operation::Pause => profiler.pause(&ctx).await,
                Operation::Resume => profiler.resume(&ctx).await,
            };
            if let Err(err) = res {
                tracing::error!(?err, %name, %operation, "profiler operation failed");
                return Err(ManagerError::backend(name, operation, err));
            }
        }
        Ok(())
    }

    /// Whether profiling is active. Never blocks.
    pub fn is_running(&self) -> bool {
        self.running.load(atomic::Ordering::Acquire)
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.read().await.state
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.profilers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.profilers.is_empty()
    }

    /// Names of the registered backends, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.profilers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> BackendKind {
        self.config.backend
    }

    /// The tagger of the backend created by [`Self::init`], or a
    /// [`NoopTagger`] before that.
    pub fn tagger(&self) -> Arc<dyn Tagger> {
        self.tagger
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopTagger))
    }

    /// Cancelled when the manager is stopped.
    pub fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.clone()
    }

    pub fn memory_monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }
}
