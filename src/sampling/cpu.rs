// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, PoisonError};

use pprof::{ProfilerGuard, ProfilerGuardBuilder, Report};

use super::{
    profile::{FoldedProfile, StackSample},
    EngineError, SamplingEngine,
};

// Frames from these libraries are signal-handler and libc noise.
const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

/// [`SamplingEngine`] backed by the `pprof` signal-based CPU sampler.
///
/// `pprof` keeps a single sampler per process, so only one engine can be
/// sampling at a time; a second start fails with [`EngineError::Pprof`].
#[derive(Default)]
pub(crate) struct PprofEngine {
    guard: Mutex<Option<ProfilerGuard<'static>>>,
}

impl std::fmt::Debug for PprofEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PprofEngine")
            .field("sampling", &self.is_sampling())
            .finish()
    }
}

impl PprofEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn is_sampling(&self) -> bool {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl SamplingEngine for PprofEngine {
    fn start_sampling(&self, frequency: u32) -> Result<(), EngineError> {
        let mut guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let frequency = i32::try_from(frequency).unwrap_or(i32::MAX);
        let started = ProfilerGuardBuilder::default()
            .frequency(frequency)
            .blocklist(BLOCKLIST)
            .build()?;
        *guard = Some(started);
        Ok(())
    }

    fn stop_sampling(&self) -> Result<FoldedProfile, EngineError> {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EngineError::NotRunning)?;
        let report = guard.report().build()?;
        // dropping the guard stops the sampling timer
        drop(guard);
        Ok(fold_report(&report))
    }
}

fn fold_report(report: &Report) -> FoldedProfile {
    let samples = report
        .data
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(frames, count)| {
            let mut stack = if frames.thread_name.is_empty() {
                frames.thread_id.to_string()
            } else {
                frames.thread_name.clone()
            };
            for frame in frames.frames.iter().rev() {
                for symbol in frame.iter().rev() {
                    stack.push(';');
                    stack.push_str(&symbol.name());
                }
            }
            StackSample {
                thread_id: frames.thread_id,
                stack,
                count: *count as u64,
            }
        })
        .collect();
    FoldedProfile::new(samples)
}
