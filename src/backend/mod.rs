// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The reference [`Profiler`](crate::profiler::Profiler) backends.
//!
//! Both drive the process CPU sampler through a sampling session and differ
//! in where the collected profiles go: [`push::PushProfiler`] uploads them to
//! an ingest server, [`local::LocalProfiler`] writes them to disk.

use std::{
    future::Future,
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
};

use tokio::sync::Mutex;

use crate::{
    config::{Config, ProfileType, DEFAULT_SAMPLE_RATE, DEFAULT_UPLOAD_INTERVAL},
    context::Context,
    memory,
    profiler::BackendError,
    reporter::Reporter,
    sampling::{SamplingEngine, SamplingSession, SessionSettings},
};

pub mod local;
#[cfg(feature = "remote-push")]
pub mod push;

#[derive(Debug)]
enum Activity {
    Idle,
    /// `None` when no configured profile type needs the CPU sampler.
    Running(Option<SamplingSession>),
    Paused,
}

/// Lifecycle shared by the sampling backends.
#[derive(Debug)]
pub(crate) struct SampledBackend {
    name: &'static str,
    config: Config,
    engine: Arc<dyn SamplingEngine>,
    activity: Mutex<Activity>,
    running: AtomicBool,
}

impl SampledBackend {
    pub(crate) fn new(name: &'static str, config: Config, engine: Arc<dyn SamplingEngine>) -> Self {
        SampledBackend {
            name,
            config,
            engine,
            activity: Mutex::new(Activity::Idle),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(atomic::Ordering::Acquire)
    }

    /// Starts sampling unless already running. `reporter` is only awaited
    /// when a sampling session is needed.
    ///
    /// The session lives until [`Self::deactivate`] or until the token of
    /// `ctx` is cancelled.
    pub(crate) async fn activate<R, F>(&self, ctx: &Context, reporter: F) -> Result<(), BackendError>
    where
        R: Reporter + Send + Sync + 'static,
        F: Future<Output = Result<R, BackendError>> + Send,
    {
        let mut activity = ctx.run(self.activity.lock()).await?;
        if let Activity::Running(_) = *activity {
            return Ok(());
        }

        if self.config.memory_limit_mb > 0 {
            memory::check_limit(self.config.memory_limit_mb)?;
        }

        let session = if self.config.profile_types.contains(&ProfileType::Cpu) {
            let reporter = ctx.run(reporter).await??;
            Some(SamplingSession::spawn(
                self.engine.clone(),
                Box::new(reporter),
                self.session_settings(),
                ctx.token(),
            )?)
        } else {
            None
        };

        let unsampled: Vec<&str> = self
            .config
            .profile_types
            .iter()
            .filter(|kind| **kind != ProfileType::Cpu)
            .map(ProfileType::as_str)
            .collect();
        if !unsampled.is_empty() {
            tracing::debug!(
                name = self.name,
                kinds = ?unsampled,
                "profile types without a sampler are not collected"
            );
        }

        *activity = Activity::Running(session);
        self.running.store(true, atomic::Ordering::Release);
        tracing::info!(name = self.name, "profiler started");
        Ok(())
    }

    /// Stops sampling, flushing what was collected. With `pause` the backend
    /// is left paused instead of idle.
    ///
    /// An uncontended backend is deactivated even under a cancelled `ctx`;
    /// only waiting for the lock and for the final flush are bounded by it.
    pub(crate) async fn deactivate(&self, ctx: &Context, pause: bool) -> Result<(), BackendError> {
        let mut activity = match self.activity.try_lock() {
            Ok(activity) => activity,
            Err(_) => ctx.run(self.activity.lock()).await?,
        };
        let next = match *activity {
            Activity::Idle => return Ok(()),
            Activity::Paused if pause => return Ok(()),
            _ if pause => Activity::Paused,
            _ => Activity::Idle,
        };

        let finished = match std::mem::replace(&mut *activity, next) {
            Activity::Running(Some(session)) => ctx.run(session.finish()).await,
            _ => Ok(()),
        };
        self.running.store(false, atomic::Ordering::Release);
        if pause {
            tracing::info!(name = self.name, "profiler paused");
        } else {
            tracing::info!(name = self.name, "profiler stopped");
        }
        // the session has been told to stop even if waiting for its flush failed
        finished?;
        Ok(())
    }

    // zero rates and intervals fall back to the defaults, as a tokio
    // interval cannot have a zero period
    fn session_settings(&self) -> SessionSettings {
        let sample_rate = match self.config.sample_rate {
            0 => DEFAULT_SAMPLE_RATE,
            hz => hz,
        };
        let upload_interval = if self.config.upload_interval.is_zero() {
            DEFAULT_UPLOAD_INTERVAL
        } else {
            self.config.upload_interval
        };
        SessionSettings {
            application_name: self.config.application_name.clone(),
            tags: self.config.tags.clone(),
            sample_rate,
            upload_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        context::ContextError,
        sampling::tests::{MockEngine, MockReporter},
    };

    fn backend(config: Config) -> (SampledBackend, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        (SampledBackend::new("test", config, engine.clone()), engine)
    }

    fn config() -> Config {
        Config::new("svc")
            .with_memory_limit_mb(0)
            .with_upload_interval(Duration::from_secs(3600))
    }

    async fn reporter(
        tx: tokio::sync::mpsc::Sender<(String, String)>,
    ) -> Result<MockReporter, BackendError> {
        Ok(MockReporter::new(tx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (backend, engine) = backend(config());
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = Context::background();
        backend.activate(&ctx, reporter(tx.clone())).await.unwrap();
        backend.activate(&ctx, reporter(tx)).await.unwrap();
        assert!(backend.is_running());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
        backend.deactivate(&ctx, false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_and_is_idempotent() {
        let (backend, engine) = backend(config());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let ctx = Context::background();

        backend.deactivate(&ctx, false).await.unwrap();
        backend.activate(&ctx, reporter(tx)).await.unwrap();
        backend.deactivate(&ctx, false).await.unwrap();
        backend.deactivate(&ctx, false).await.unwrap();

        assert!(!backend.is_running());
        assert!(!engine.is_sampling());
        let (folded, app) = rx.recv().await.unwrap();
        assert_eq!(folded, "main;work0 1\n");
        assert_eq!(app, "svc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let (backend, engine) = backend(config());
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = Context::background();

        backend.activate(&ctx, reporter(tx.clone())).await.unwrap();
        backend.deactivate(&ctx, true).await.unwrap();
        backend.deactivate(&ctx, true).await.unwrap();
        assert!(!backend.is_running());
        assert!(!engine.is_sampling());
        assert!(matches!(*backend.activity.lock().await, Activity::Paused));

        backend.activate(&ctx, reporter(tx)).await.unwrap();
        assert!(backend.is_running());
        assert!(engine.is_sampling());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 2);

        backend.deactivate(&ctx, false).await.unwrap();
        assert!(matches!(*backend.activity.lock().await, Activity::Idle));
    }

    #[tokio::test]
    async fn test_without_cpu_holds_nothing() {
        let (backend, engine) = backend(config().with_profile_types([
            ProfileType::AllocSpace,
            ProfileType::MutexCount,
        ]));
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = Context::background();
        backend.activate(&ctx, reporter(tx)).await.unwrap();
        assert!(backend.is_running());
        assert!(!engine.is_sampling());
        backend.deactivate(&ctx, false).await.unwrap();
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn test_memory_limit_blocks_start() {
        // a test process is always larger than 1 MB
        let (backend, engine) = backend(config().with_memory_limit_mb(1));
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let err = backend
            .activate(&Context::background(), reporter(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MemoryLimit(_)), "{err}");
        assert!(!backend.is_running());
        assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let (backend, engine) = backend(config());
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let token = CancellationToken::new();
        token.cancel();
        let err = backend
            .activate(&Context::new(token), reporter(tx))
            .await
            .unwrap_err();
        assert!(
            matches!(err, BackendError::Context(ContextError::Cancelled)),
            "{err}"
        );
        assert!(!backend.is_running());
        assert!(!engine.is_sampling());
    }

    #[tokio::test]
    async fn test_stop_under_cancelled_context() {
        let (backend, _engine) = backend(config().with_profile_types([ProfileType::InuseSpace]));
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        backend
            .activate(&Context::background(), reporter(tx))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let cancelled = Context::new(token);
        backend.deactivate(&cancelled, false).await.unwrap();
        backend.deactivate(&cancelled, false).await.unwrap();
        assert!(!backend.is_running());
        assert!(matches!(*backend.activity.lock().await, Activity::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_parent_token_cancelled() {
        let (backend, engine) = backend(config());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let parent = CancellationToken::new();
        backend
            .activate(&Context::new(parent.clone()), reporter(tx))
            .await
            .unwrap();
        assert!(engine.is_sampling());

        parent.cancel();
        backend
            .deactivate(&Context::background(), false)
            .await
            .unwrap();
        assert!(!backend.is_running());
        assert!(!engine.is_sampling());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_engine_failure() {
        let (backend, engine) = backend(config());
        engine.fail_start.store(true, Ordering::SeqCst);
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let err = backend
            .activate(&Context::background(), reporter(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Engine(_)), "{err}");
        assert!(!backend.is_running());
    }
}
