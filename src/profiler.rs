// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The contract every profiling backend implements.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    context::{Context, ContextError},
    memory::MemoryLimitError,
    sampling::EngineError,
    tagging::{NoopTagger, Tagger},
};

/// A lifecycle operation, as reported in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    Pause,
    Resume,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
        })
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error(transparent)]
    MemoryLimit(#[from] MemoryLimitError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[cfg(feature = "remote-push")]
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("loading tls identity: {0}")]
    Tls(#[source] io::Error),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// A profiling backend.
///
/// Mutating operations are idempotent and take the [`Context`] they must
/// honor: an implementation stops waiting and fails with
/// [`BackendError::Context`] when the context is cancelled or its timeout
/// elapses.
#[async_trait]
pub trait Profiler: Send + Sync + fmt::Debug {
    /// Starts profiling. A no-op if already running.
    async fn start(&self, ctx: &Context) -> Result<(), BackendError>;

    /// Stops profiling and releases the backend's resources. A no-op if not
    /// running.
    async fn stop(&self, ctx: &Context) -> Result<(), BackendError>;

    /// Temporarily stops collecting. What a paused backend keeps is up to
    /// the backend.
    async fn pause(&self, ctx: &Context) -> Result<(), BackendError>;

    async fn resume(&self, ctx: &Context) -> Result<(), BackendError>;

    /// Never blocks.
    fn is_running(&self) -> bool;

    /// Unique name of this backend within a manager.
    fn name(&self) -> &str;

    fn tagger(&self) -> Arc<dyn Tagger> {
        Arc::new(NoopTagger)
    }
}
