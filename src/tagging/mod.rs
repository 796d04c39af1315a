// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Attaching request-scoped metadata to profiling samples.
//!
//! Every backend exposes a [`Tagger`]. Backends that cannot annotate samples
//! at runtime hand out [`NoopTagger`], whose operations always succeed and do
//! nothing, so callers can tag unconditionally.
//!
//! ```
//! use unified_profiling::context::Context;
//! use unified_profiling::tagging::{self, LabelTagger, Tagger};
//!
//! let tagger = LabelTagger::default();
//! let res: Result<u32, std::io::Error> =
//!     tagging::tag_wrapper(&tagger, &Context::background(), "route", "/users", |_ctx| {
//!         assert_eq!(tagging::labels::current().get("route"), Some("/users"));
//!         Ok(4)
//!     });
//! assert_eq!(res.unwrap(), 4);
//! assert!(tagging::labels::current().get("route").is_none());
//! ```

use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use thiserror::Error;

use crate::context::Context;

pub mod labels;
pub mod layer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TagError {
    #[error("tag key must not be empty")]
    EmptyKey,
}

/// Runtime sample annotation. The provided methods are the no-op behaviour
/// of backends without tagging support.
pub trait Tagger: Send + Sync + fmt::Debug {
    /// Attaches `key=value` to the calling thread for the rest of its work.
    fn add_tag(&self, key: &str, value: &str) -> Result<(), TagError> {
        let _ = (key, value);
        Ok(())
    }

    /// Applies `key=value` until the returned guard is dropped.
    fn scope(&self, key: &str, value: &str) -> TagScope {
        let _ = (key, value);
        TagScope::inert()
    }
}

/// Tagger of backends without runtime tagging support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagger;

impl Tagger for NoopTagger {}

/// Tagger backed by the thread-scoped [`labels`] store, from which the
/// remote-push backend attributes samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelTagger;

impl Tagger for LabelTagger {
    fn add_tag(&self, key: &str, value: &str) -> Result<(), TagError> {
        if key.is_empty() {
            return Err(TagError::EmptyKey);
        }
        labels::insert_ambient(key, value);
        Ok(())
    }

    fn scope(&self, key: &str, value: &str) -> TagScope {
        if key.is_empty() {
            tracing::debug!("ignoring tag scope with an empty key");
            return TagScope::inert();
        }
        TagScope {
            label: labels::push(key, value),
            _thread_bound: PhantomData,
        }
    }
}

/// Guard returned by [`Tagger::scope`]. Dropping it removes the label.
///
/// Labels live on the thread that created them, so the guard cannot be sent
/// to another thread.
#[must_use = "the tag is removed as soon as the scope is dropped"]
pub struct TagScope {
    label: Option<labels::ScopeId>,
    _thread_bound: PhantomData<*const ()>,
}

impl TagScope {
    /// A guard that applies and removes nothing.
    pub fn inert() -> Self {
        TagScope {
            label: None,
            _thread_bound: PhantomData,
        }
    }
}

impl fmt::Debug for TagScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagScope").field("label", &self.label).finish()
    }
}

impl Drop for TagScope {
    fn drop(&mut self) {
        if let Some(id) = self.label.take() {
            labels::remove(id);
        }
    }
}

/// Runs `f` with `key=value` applied only for the duration of the call and
/// returns its result unchanged.
pub fn tag_wrapper<T, E, F>(
    tagger: &dyn Tagger,
    ctx: &Context,
    key: &str,
    value: &str,
    f: F,
) -> Result<T, E>
where
    F: FnOnce(&Context) -> Result<T, E>,
{
    let _scope = tagger.scope(key, value);
    f(ctx)
}

/// Wraps `future` so that `key=value` is applied around each of its polls,
/// whichever thread it is polled on.
pub fn tagged<F: Future>(
    tagger: Arc<dyn Tagger>,
    key: impl Into<String>,
    value: impl Into<String>,
    future: F,
) -> Tagged<F> {
    Tagged {
        tagger,
        key: key.into(),
        value: value.into(),
        future: Box::pin(future),
    }
}

/// Future returned by [`tagged`].
#[must_use = "futures do nothing unless polled"]
pub struct Tagged<F> {
    tagger: Arc<dyn Tagger>,
    key: String,
    value: String,
    future: Pin<Box<F>>,
}

impl<F> fmt::Debug for Tagged<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl<F: Future> Future for Tagged<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _scope = this.tagger.scope(&this.key, &this.value);
        this.future.as_mut().poll(cx)
    }
}
