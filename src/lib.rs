// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## unified-profiling
//! A single lifecycle facade over continuous-profiling backends. An application
//! enables profiling once, tags samples with request-scoped metadata, and
//! starts, pauses or stops profiling at runtime without knowing which backend
//! is collecting.
//!
//! ### Backends
//!
//! Two backends are included, both sampling the process CPU with [pprof]:
//!
//! 1. **remote-push** ([`backend::push::PushProfiler`], cargo feature
//!    `remote-push`, on by default) uploads collapsed stacks to the `/ingest`
//!    endpoint of a Pyroscope-compatible server every upload interval.
//!    Samples are attributed to the labels applied through its tagger.
//! 2. **local-sampling** ([`backend::local::LocalProfiler`]) writes one
//!    `{application}.cpu.{timestamp}.folded` file per upload interval into
//!    the configured output directory. It does not support runtime tagging.
//!
//! Other profile kinds (allocations, contention, ...) are accepted in the
//! configuration for compatibility but have no sampler in a Rust process.
//!
//! [pprof]: https://docs.rs/pprof
//!
//! ### Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use unified_profiling::config::{BackendKind, Config};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), unified_profiling::Error> {
//! let config = Config::new("checkout")
//!     .with_backend(BackendKind::RemotePush)
//!     .with_server_address("http://pyroscope:4040")
//!     .with_tag("env", "prod")
//!     .with_upload_interval(Duration::from_secs(15));
//! unified_profiling::initialize(config).await?;
//!
//! let total: Result<u64, unified_profiling::Error> =
//!     unified_profiling::tag_wrapper(None, "route", "/cart", |_ctx| Ok(42));
//!
//! unified_profiling::stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Applications that prefer explicit ownership over process-wide state can
//! drive a [`manager::ProfilerManager`] directly, and register their own
//! [`profiler::Profiler`] implementations with
//! [`manager::ProfilerManager::add_profiler`].
//!
//! ### Memory guard
//!
//! With a non-zero `memory_limit_mb`, backends refuse to start while the
//! resident set size is above the limit, and the manager periodically logs a
//! warning while it stays above. See [`memory`].
//!
//! #### Sample program
//!
//! ```notrust
//! cargo run --example simple -- --backend local-sampling --output-dir /tmp/profiles --duration 30s
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod global;
pub mod manager;
pub mod memory;
pub mod metadata;
pub mod profiler;
pub mod reporter;
pub mod sampling;
pub mod tagging;

pub use global::{
    active_manager, add_tag, init_legacy, initialize, is_running, pause, resume, start, stop,
    tag_wrapper, wrap_subscriber, Error,
};
