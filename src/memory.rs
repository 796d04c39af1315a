// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Resident memory guard.
//!
//! [`check_limit`] is the synchronous check backends run before starting.
//! [`MemoryMonitor`] re-runs the same check periodically in the background and
//! reports (logs and counts) every time the ceiling is exceeded. It never acts
//! on the process itself: refusing to start is left to callers of
//! [`check_limit`].

use std::{
    fmt,
    sync::{
        atomic::{self, AtomicU64},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Interval between two checks of a running [`MemoryMonitor`].
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("memory usage {current_mb:.2} MB exceeds limit of {limit_mb:.2} MB")]
pub struct MemoryLimitError {
    pub current_mb: f64,
    pub limit_mb: f64,
}

/// Current resident set size of the process in bytes, or 0 if the platform
/// does not report it.
pub fn resident_bytes() -> u64 {
    memory_stats::memory_stats()
        .map(|stats| stats.physical_mem as u64)
        .unwrap_or(0)
}

/// Fails if the resident set size exceeds `limit_mb`. A limit of 0 always passes.
pub fn check_limit(limit_mb: u64) -> Result<(), MemoryLimitError> {
    if limit_mb == 0 {
        return Ok(());
    }
    check_usage(limit_mb, resident_bytes())
}

fn check_usage(limit_mb: u64, usage_bytes: u64) -> Result<(), MemoryLimitError> {
    if limit_mb == 0 {
        return Ok(());
    }
    let current_mb = usage_bytes as f64 / BYTES_PER_MB;
    let limit_mb = limit_mb as f64;
    if current_mb > limit_mb {
        Err(MemoryLimitError {
            current_mb,
            limit_mb,
        })
    } else {
        Ok(())
    }
}

type UsageFn = Arc<dyn Fn() -> u64 + Send + Sync>;

struct MonitorShared {
    limit_mb: AtomicU64,
    exceeded: AtomicU64,
    usage: UsageFn,
}

impl MonitorShared {
    fn check(&self) -> Result<(), MemoryLimitError> {
        check_usage(
            self.limit_mb.load(atomic::Ordering::Relaxed),
            (self.usage)(),
        )
    }
}

/// Periodic background memory check. Cloning yields another handle to the
/// same monitor.
#[derive(Clone)]
pub struct MemoryMonitor {
    shared: Arc<MonitorShared>,
    interval: Duration,
    stop: Arc<Mutex<Option<CancellationToken>>>,
}

impl fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMonitor")
            .field("limit_mb", &self.limit_mb())
            .field("interval", &self.interval)
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

impl MemoryMonitor {
    pub fn new(limit_mb: u64) -> Self {
        Self::with_usage_fn(limit_mb, resident_bytes)
    }

    /// A monitor measuring usage (in bytes) with `usage` instead of the
    /// process resident set size.
    pub fn with_usage_fn(limit_mb: u64, usage: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        MemoryMonitor {
            shared: Arc::new(MonitorShared {
                limit_mb: AtomicU64::new(limit_mb),
                exceeded: AtomicU64::new(0),
                usage: Arc::new(usage),
            }),
            interval: DEFAULT_CHECK_INTERVAL,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets the period of the background check. A zero period falls back to
    /// [`DEFAULT_CHECK_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = if interval.is_zero() {
            DEFAULT_CHECK_INTERVAL
        } else {
            interval
        };
        self
    }

    /// Starts the background check. Does nothing if it is already running.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.start_under(&CancellationToken::new());
    }

    /// Like [`Self::start`], but the check also ends when `parent` is cancelled.
    pub fn start_under(&self, parent: &CancellationToken) {
        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if stop.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = parent.child_token();
        tokio::spawn(monitor_loop(
            self.shared.clone(),
            self.interval,
            token.clone(),
        ));
        *stop = Some(token);
        tracing::debug!(limit_mb = self.limit_mb(), "memory monitor started");
    }

    /// Stops the background check. The loop exits at its next wake-up.
    pub fn stop(&self) {
        let token = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            tracing::debug!("memory monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn is_within_limit(&self) -> bool {
        self.shared.check().is_ok()
    }

    /// Current usage in MB, as measured by this monitor.
    pub fn usage_mb(&self) -> f64 {
        (self.shared.usage)() as f64 / BYTES_PER_MB
    }

    pub fn limit_mb(&self) -> u64 {
        self.shared.limit_mb.load(atomic::Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit_mb: u64) {
        self.shared.limit_mb.store(limit_mb, atomic::Ordering::Relaxed);
    }

    /// How many background checks found usage above the limit.
    pub fn exceeded_count(&self) -> u64 {
        self.shared.exceeded.load(atomic::Ordering::Relaxed)
    }
}

async fn monitor_loop(shared: Arc<MonitorShared>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = shared.check() {
                    shared.exceeded.fetch_add(1, atomic::Ordering::Relaxed);
                    tracing::warn!(%err, "memory usage above the configured limit");
                }
            }
        }
    }
    tracing::debug!("memory monitor loop finished");
}
