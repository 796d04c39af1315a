// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CPU sampling sessions.
//!
//! A [`SamplingSession`] owns a running [`SamplingEngine`] and a tokio task
//! that rotates it every upload interval: the engine is stopped, immediately
//! restarted so sampling continues while the collected profile is reported,
//! and the profile is handed to a [`Reporter`]. Stopping the session flushes
//! whatever was collected since the last rotation.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    io,
    sync::Arc,
    time::{Duration, SystemTime, SystemTimeError, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{metadata::ReportMetadata, reporter::Reporter};

mod cpu;
mod profile;

pub(crate) use cpu::PprofEngine;
pub use profile::{FoldedProfile, StackSample};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("cpu sampler: {0}")]
    Pprof(#[from] pprof::Error),
    #[error("cpu sampler is already running")]
    AlreadyRunning,
    #[error("cpu sampler is not running")]
    NotRunning,
    #[error("cpu sampler: {0}")]
    Io(#[from] io::Error),
}

/// The process-level CPU sampler driven by a [`SamplingSession`].
pub(crate) trait SamplingEngine: Send + Sync + fmt::Debug + 'static {
    /// Starts sampling every thread of the process `frequency` times per second.
    fn start_sampling(&self, frequency: u32) -> Result<(), EngineError>;
    /// Stops sampling and returns what was collected since the matching start.
    fn stop_sampling(&self) -> Result<FoldedProfile, EngineError>;
}

enum Status {
    Idle,
    Running(SystemTime),
}

/// Tracks whether the engine is sampling. When this type drops, it stops
/// the engine if it's running.
struct SamplerState {
    engine: Arc<dyn SamplingEngine>,
    status: Status,
}

impl SamplerState {
    fn new(engine: Arc<dyn SamplingEngine>) -> Self {
        SamplerState {
            engine,
            status: Status::Idle,
        }
    }

    fn start(&mut self, frequency: u32) -> Result<(), EngineError> {
        self.engine.start_sampling(frequency)?;
        self.status = Status::Running(SystemTime::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<Option<(SystemTime, FoldedProfile)>, EngineError> {
        match std::mem::replace(&mut self.status, Status::Idle) {
            Status::Idle => Ok(None),
            Status::Running(since) => Ok(Some((since, self.engine.stop_sampling()?))),
        }
    }
}

impl Drop for SamplerState {
    fn drop(&mut self) {
        if let Status::Running(_) = self.status {
            if let Err(err) = self.engine.stop_sampling() {
                tracing::warn!(?err, "unable to stop cpu sampler during drop glue");
            }
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
enum TickError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("reporter: {0}")]
    Reporter(Box<dyn std::error::Error + Send>),
    #[error("broken clock: {0}")]
    BrokenClock(#[from] SystemTimeError),
}

/// What a session reports its profiles as.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) application_name: String,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) sample_rate: u32,
    pub(crate) upload_interval: Duration,
}

/// A running CPU sampler and its rotation task. Dropping the session stops
/// the task after a final flush.
#[derive(Debug)]
pub(crate) struct SamplingSession {
    stop: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl SamplingSession {
    /// Starts the engine and spawns the rotation task. The task also ends
    /// when `parent` is cancelled. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        engine: Arc<dyn SamplingEngine>,
        reporter: Box<dyn Reporter + Send + Sync>,
        settings: SessionSettings,
        parent: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let mut state = SamplerState::new(engine);
        state.start(settings.sample_rate)?;
        tracing::info!(
            sample_rate = settings.sample_rate,
            upload_interval = ?settings.upload_interval,
            "cpu sampling started"
        );

        let stop = parent.child_token();
        let task_stop = stop.clone();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + settings.upload_interval,
                settings.upload_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let last = tokio::select! {
                    biased;

                    _ = task_stop.cancelled() => true,
                    _ = ticker.tick() => false,
                };
                tracing::debug!(last, "sampling timer woke up");

                if let Err(err) = session_tick(&mut state, &*reporter, &settings, last).await {
                    match &err {
                        TickError::Reporter(_) => {
                            // don't stop on IO errors
                            tracing::error!(?err, "error during profiling, continuing");
                        }
                        _stop => {
                            tracing::error!(?err, "error during profiling, stopping");
                            break;
                        }
                    }
                }
                if last {
                    break;
                }
            }

            tracing::info!("sampling session finished");
        });

        Ok(SamplingSession {
            stop,
            join_handle: Some(join_handle),
        })
    }

    /// Stops the session and resolves once the final flush is done. The
    /// session is signalled to stop even if the returned future is dropped
    /// before completion.
    pub(crate) fn finish(mut self) -> impl Future<Output = ()> {
        self.stop.cancel();
        let join_handle = self.join_handle.take();
        async move {
            if let Some(join_handle) = join_handle {
                if let Err(err) = join_handle.await {
                    tracing::warn!(?err, "sampling task failed");
                }
            }
        }
    }
}

impl Drop for SamplingSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn session_tick(
    state: &mut SamplerState,
    reporter: &(dyn Reporter + Send + Sync),
    settings: &SessionSettings,
    last: bool,
) -> Result<(), TickError> {
    let Some((since, profile)) = state.stop()? else {
        tracing::warn!("stopped the cpu sampler but it wasn't running?");
        return Ok(());
    };
    let start = since.duration_since(UNIX_EPOCH)?;
    let end = SystemTime::now().duration_since(UNIX_EPOCH)?;

    // Start it up immediately so the application keeps being sampled while
    // we're reporting.
    if !last {
        state.start(settings.sample_rate)?;
    }

    if profile.is_empty() {
        tracing::debug!("no cpu samples collected in this interval");
        return Ok(());
    }

    let report_metadata = ReportMetadata {
        application_name: &settings.application_name,
        tags: &settings.tags,
        start,
        end,
        sample_rate: settings.sample_rate,
        reporting_interval: settings.upload_interval,
    };

    reporter
        .report(profile, &report_metadata)
        .await
        .map_err(TickError::Reporter)?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{self, AtomicBool, AtomicU32};

    use super::*;

    /// Engine that returns one sample per rotation, `main;work{n}` where `n`
    /// counts the stops so far.
    #[derive(Debug, Default)]
    pub(crate) struct MockEngine {
        running: AtomicBool,
        pub(crate) starts: AtomicU32,
        pub(crate) stops: AtomicU32,
        pub(crate) fail_start: AtomicBool,
    }

    impl MockEngine {
        pub(crate) fn is_sampling(&self) -> bool {
            self.running.load(atomic::Ordering::SeqCst)
        }
    }

    impl SamplingEngine for MockEngine {
        fn start_sampling(&self, _frequency: u32) -> Result<(), EngineError> {
            if self.fail_start.load(atomic::Ordering::SeqCst) {
                return Err(EngineError::Io(io::Error::other("mock start failure")));
            }
            if self.running.swap(true, atomic::Ordering::SeqCst) {
                return Err(EngineError::AlreadyRunning);
            }
            self.starts.fetch_add(1, atomic::Ordering::SeqCst);
            Ok(())
        }

        fn stop_sampling(&self) -> Result<FoldedProfile, EngineError> {
            if !self.running.swap(false, atomic::Ordering::SeqCst) {
                return Err(EngineError::NotRunning);
            }
            let n = self.stops.fetch_add(1, atomic::Ordering::SeqCst);
            Ok(FoldedProfile::new(vec![StackSample {
                thread_id: 1,
                stack: format!("main;work{n}"),
                count: 1,
            }]))
        }
    }

    pub(crate) struct MockReporter {
        tx: tokio::sync::mpsc::Sender<(String, String)>,
        fail: bool,
    }

    impl MockReporter {
        pub(crate) fn new(tx: tokio::sync::mpsc::Sender<(String, String)>) -> Self {
            MockReporter { tx, fail: false }
        }
    }

    impl fmt::Debug for MockReporter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockReporter").finish()
        }
    }

    #[async_trait::async_trait]
    impl Reporter for MockReporter {
        async fn report(
            &self,
            profile: FoldedProfile,
            metadata: &ReportMetadata,
        ) -> Result<(), Box<dyn std::error::Error + Send>> {
            self.tx
                .send((profile.to_folded(), metadata.application_name.to_owned()))
                .await
                .unwrap();
            if self.fail {
                return Err(Box::new(io::Error::other("mock report failure")));
            }
            Ok(())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            application_name: "svc".into(),
            tags: BTreeMap::new(),
            sample_rate: 100,
            upload_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_rotates_and_flushes() {
        let engine = Arc::new(MockEngine::default());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let session = SamplingSession::spawn(
            engine.clone(),
            Box::new(MockReporter::new(tx)),
            settings(),
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(engine.is_sampling());

        let (folded, app) = rx.recv().await.unwrap();
        assert_eq!(folded, "main;work0 1\n");
        assert_eq!(app, "svc");
        let (folded, _) = rx.recv().await.unwrap();
        assert_eq!(folded, "main;work1 1\n");
        assert!(engine.is_sampling());

        session.finish().await;
        let (folded, _) = rx.recv().await.unwrap();
        assert_eq!(folded, "main;work2 1\n");
        assert!(!engine.is_sampling());
        assert_eq!(engine.starts.load(atomic::Ordering::SeqCst), 3);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_continues_after_reporter_error() {
        let engine = Arc::new(MockEngine::default());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let session = SamplingSession::spawn(
            engine.clone(),
            Box::new(MockReporter { tx, fail: true }),
            settings(),
            &CancellationToken::new(),
        )
        .unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert!(engine.is_sampling());
        session.finish().await;
        assert!(!engine.is_sampling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stops_on_engine_error() {
        let engine = Arc::new(MockEngine::default());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let _session = SamplingSession::spawn(
            engine.clone(),
            Box::new(MockReporter::new(tx)),
            settings(),
            &CancellationToken::new(),
        )
        .unwrap();
        engine.fail_start.store(true, atomic::Ordering::SeqCst);
        // the restart after the first rotation fails, which ends the task
        // before anything is reported
        assert!(rx.recv().await.is_none());
        assert!(!engine.is_sampling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_follows_parent_token() {
        let engine = Arc::new(MockEngine::default());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let parent = CancellationToken::new();
        let _session = SamplingSession::spawn(
            engine.clone(),
            Box::new(MockReporter::new(tx)),
            settings(),
            &parent,
        )
        .unwrap();
        parent.cancel();
        let (folded, _) = rx.recv().await.unwrap();
        assert_eq!(folded, "main;work0 1\n");
        assert!(rx.recv().await.is_none());
        assert!(!engine.is_sampling());
    }

    #[test]
    fn test_spawn_fails_when_engine_fails() {
        let engine = Arc::new(MockEngine::default());
        engine.fail_start.store(true, atomic::Ordering::SeqCst);
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let res = SamplingSession::spawn(
            engine,
            Box::new(MockReporter::new(tx)),
            settings(),
            &CancellationToken::new(),
        );
        assert!(matches!(res, Err(EngineError::Io(_))));
    }
}
