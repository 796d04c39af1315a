// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local-sampling backend: CPU profiles are written to `output_dir`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::Config,
    context::Context,
    profiler::{BackendError, Profiler},
    reporter::local::LocalReporter,
    sampling::{PprofEngine, SamplingEngine},
};

use super::SampledBackend;

/// Samples the process and writes one collapsed-stack file per upload
/// interval into the configured output directory.
///
/// Pausing stops the CPU sampler and its flush task, flushing what was
/// collected so far; a paused backend holds no resources and reports itself
/// as not running. Resuming starts sampling again. Runtime tagging is not
/// supported.
#[derive(Debug)]
pub struct LocalProfiler {
    inner: SampledBackend,
}

impl LocalProfiler {
    pub const NAME: &'static str = "local-sampling";

    pub fn new(config: Config) -> Self {
        Self::with_engine(config, Arc::new(PprofEngine::new()))
    }

    pub(crate) fn with_engine(config: Config, engine: Arc<dyn SamplingEngine>) -> Self {
        LocalProfiler {
            inner: SampledBackend::new(Self::NAME, config, engine),
        }
    }
}

#[async_trait]
impl Profiler for LocalProfiler {
    async fn start(&self, ctx: &Context) -> Result<(), BackendError> {
        let output_dir = self.inner.config().output_dir.clone();
        self.inner
            .activate(ctx, async move { Ok(LocalReporter::new(output_dir)) })
            .await
    }

    async fn stop(&self, ctx: &Context) -> Result<(), BackendError> {
        self.inner.deactivate(ctx, false).await
    }

    async fn pause(&self, ctx: &Context) -> Result<(), BackendError> {
        self.inner.deactivate(ctx, true).await
    }

    async fn resume(&self, ctx: &Context) -> Result<(), BackendError> {
        self.start(ctx).await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::BackendKind, sampling::tests::MockEngine, tagging::Tagger};

    fn folded_files(dir: &std::path::Path) -> Vec<String> {
        let mut files: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .flat_map(|f| f.ok())
            .map(|f| f.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".folded"))
            .collect();
        files.sort();
        files
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::default());
        let profiler = LocalProfiler::with_engine(
            Config::new("svc")
                .with_backend(BackendKind::LocalSampling)
                .with_memory_limit_mb(0)
                .with_upload_interval(Duration::from_secs(10))
                .with_output_dir(dir.path()),
            engine.clone(),
        );
        assert_eq!(profiler.name(), "local-sampling");

        let ctx = Context::background();
        profiler.start(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        profiler.pause(&ctx).await.unwrap();
        assert!(!profiler.is_running());
        assert!(!engine.is_sampling());

        // one rotation plus the flush on pause
        assert_eq!(engine.stops.load(std::sync::atomic::Ordering::SeqCst), 2);
        let files = folded_files(dir.path());
        assert!(!files.is_empty());
        assert!(files.iter().all(|f| f.starts_with("svc.cpu.")), "{files:?}");

        profiler.resume(&ctx).await.unwrap();
        assert!(profiler.is_running());
        assert!(engine.is_sampling());
        profiler.stop(&ctx).await.unwrap();
        profiler.stop(&ctx).await.unwrap();
        assert!(!engine.is_sampling());
    }

    #[test]
    fn test_tagging_is_noop() {
        let profiler = LocalProfiler::new(Config::new("svc"));
        let tagger = profiler.tagger();
        tagger.add_tag("", "ignored").unwrap();
        let _scope = tagger.scope("route", "/users");
        assert!(crate::tagging::labels::current().get("route").is_none());
    }
}
