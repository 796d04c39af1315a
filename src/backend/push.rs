// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote-push backend: CPU profiles are uploaded to a Pyroscope-compatible
//! ingest server.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::Config,
    context::Context,
    profiler::{BackendError, Profiler},
    reporter::ingest::IngestReporter,
    sampling::{PprofEngine, SamplingEngine},
    tagging::{LabelTagger, Tagger},
};

use super::SampledBackend;

/// Pushes CPU profiles to `{server_address}/ingest`.
///
/// Samples are attributed to the labels applied through [`LabelTagger`],
/// which this backend hands out as its tagger. Pausing is a full stop and
/// resuming a full start.
#[derive(Debug)]
pub struct PushProfiler {
    inner: SampledBackend,
}

impl PushProfiler {
    pub const NAME: &'static str = "remote-push";

    pub fn new(config: Config) -> Self {
        Self::with_engine(config, Arc::new(PprofEngine::new()))
    }

    pub(crate) fn with_engine(config: Config, engine: Arc<dyn SamplingEngine>) -> Self {
        PushProfiler {
            inner: SampledBackend::new(Self::NAME, config, engine),
        }
    }

    async fn connect(config: &Config) -> Result<IngestReporter, BackendError> {
        let mut builder = reqwest::Client::builder();
        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }
        if config.enable_tls {
            if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
                let mut pem = tokio::fs::read(cert).await.map_err(BackendError::Tls)?;
                pem.push(b'\n');
                pem.extend(tokio::fs::read(key).await.map_err(BackendError::Tls)?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(BackendError::Client)?;
                builder = builder.identity(identity);
            }
        }
        if config.skip_tls_verify {
            tracing::warn!("tls certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().map_err(BackendError::Client)?;

        let address = config.server_address.trim();
        let reporter = if config.enable_tls && !address.contains("://") {
            IngestReporter::new(client, &format!("https://{address}"))
        } else {
            IngestReporter::new(client, address)
        };
        tracing::debug!(url = reporter.url(), "ingest client ready");
        Ok(reporter)
    }
}

#[async_trait]
impl Profiler for PushProfiler {
    async fn start(&self, ctx: &Context) -> Result<(), BackendError> {
        self.inner
            .activate(ctx, Self::connect(self.inner.config()))
            .await
    }

    async fn stop(&self, ctx: &Context) -> Result<(), BackendError> {
        self.inner.deactivate(ctx, false).await
    }

    async fn pause(&self, ctx: &Context) -> Result<(), BackendError> {
        self.inner.deactivate(ctx, false).await
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

    fn tagger(&self) -> Arc<dyn Tagger> {
        Arc::new(LabelTagger)
    }
}
