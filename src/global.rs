// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide profiling, for applications that want a single profiler
//! without passing a [`ProfilerManager`] around.
//!
//! ```no_run
//! # async fn run() -> Result<(), unified_profiling::Error> {
//! use unified_profiling::config::{BackendKind, Config};
//!
//! let lifecycle = unified_profiling::initialize(
//!     Config::new("checkout").with_backend(BackendKind::LocalSampling),
//! )
//! .await?;
//! unified_profiling::add_tag("region", "eu-west-1")?;
//! // ... application work ...
//! unified_profiling::stop().await?;
//! assert!(lifecycle.is_cancelled());
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Subscriber;
use tracing_subscriber::layer::{Layer, Layered};

use crate::{
    config::{BackendKind, Config, LegacyConfig},
    context::Context,
    manager::{ManagerError, ProfilerManager},
    tagging::{self, layer::ProfilingLayer, TagError},
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("profiling has not been initialized")]
    NotInitialized,
    #[error("profiling is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("installing the tracing subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

static ACTIVE: Mutex<Option<Arc<ProfilerManager>>> = Mutex::new(None);

// serializes initialize and stop, which await while holding no lock on ACTIVE
static LIFECYCLE: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// The manager installed by [`initialize`], if any.
pub fn active_manager() -> Option<Arc<ProfilerManager>> {
    ACTIVE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn manager() -> Result<Arc<ProfilerManager>, Error> {
    active_manager().ok_or(Error::NotInitialized)
}

fn profiling_layer(backend: BackendKind) -> Option<ProfilingLayer> {
    match backend {
        BackendKind::RemotePush => Some(ProfilingLayer::new()),
        _ => None,
    }
}

/// Initializes process-wide profiling and returns the lifecycle token, which
/// is cancelled by [`stop`].
///
/// Unset fields of `config` get their defaults. If
/// [`Config::tracing_subscriber`] is set, it is wrapped as by
/// [`wrap_subscriber`] and installed as the global default subscriber. On
/// failure nothing is installed.
pub async fn initialize(config: Config) -> Result<CancellationToken, Error> {
    let _lifecycle = LIFECYCLE.lock().await;
    if active_manager().is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let mut config = config.with_defaults();
    let subscriber = config.tracing_subscriber.take();
    let manager = Arc::new(ProfilerManager::new(config));

    if let Err(err) = manager.init().await {
        if let Err(stop_err) = manager.stop().await {
            tracing::debug!(?stop_err, "cleanup after failed initialization");
        }
        return Err(err.into());
    }

    if let Some(subscriber) = subscriber {
        let layered = profiling_layer(manager.backend()).with_subscriber(subscriber.into_inner());
        if let Err(err) = tracing::subscriber::set_global_default(layered) {
            if let Err(stop_err) = manager.stop().await {
                tracing::debug!(?stop_err, "cleanup after failed initialization");
            }
            return Err(err.into());
        }
    }

    let lifecycle = manager.lifecycle();
    *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = Some(manager);
    Ok(lifecycle)
}

/// [`initialize`] from a configuration in the legacy shape.
pub async fn init_legacy(
    legacy: LegacyConfig,
    additional_attrs: Vec<serde_json::Value>,
) -> Result<CancellationToken, Error> {
    initialize(legacy.into_config(additional_attrs)).await
}

/// Stops process-wide profiling and uninstalls the manager. A no-op if
/// profiling was never initialized.
pub async fn stop() -> Result<(), Error> {
    let _lifecycle = LIFECYCLE.lock().await;
    let manager = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).take();
    match manager {
        Some(manager) => Ok(manager.stop().await?),
        None => Ok(()),
    }
}

pub async fn start() -> Result<(), Error> {
    Ok(manager()?.start().await?)
}

pub async fn pause() -> Result<(), Error> {
    Ok(manager()?.pause().await?)
}

pub async fn resume() -> Result<(), Error> {
    Ok(manager()?.resume().await?)
}

/// False if profiling was never initialized.
pub fn is_running() -> bool {
    active_manager().is_some_and(|manager| manager.is_running())
}

/// Attaches `key=value` to the calling thread through the active backend's
/// tagger.
pub fn add_tag(key: &str, value: &str) -> Result<(), Error> {
    Ok(manager()?.tagger().add_tag(key, value)?)
}

/// Runs `f` with `key=value` applied for the duration of the call, through
/// the active backend's tagger. Without `ctx`, `f` receives a context bound
/// to the lifecycle token.
pub fn tag_wrapper<T, E, F>(ctx: Option<&Context>, key: &str, value: &str, f: F) -> Result<T, E>
where
    E: From<Error>,
    F: FnOnce(&Context) -> Result<T, E>,
{
    let manager = manager().map_err(E::from)?;
    let ctx = match ctx {
        Some(ctx) => ctx.clone(),
        None => Context::new(manager.lifecycle()),
    };
    tagging::tag_wrapper(&*manager.tagger(), &ctx, key, value, f)
}

/// Layers `subscriber` with a [`ProfilingLayer`] when the active backend
/// attributes samples to labels, so the id of the entered span is attached
/// to every sample. With other backends the subscriber behaves as before.
pub fn wrap_subscriber<S: Subscriber>(
    subscriber: S,
) -> Result<Layered<Option<ProfilingLayer>, S>, Error> {
    let manager = manager()?;
    Ok(profiling_layer(manager.backend()).with_subscriber(subscriber))
}
