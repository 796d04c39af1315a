// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

pub use std::time::Duration;

/// Describes one reported profile: who produced it and the interval it covers.
/// `start` and `end` are offsets from the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportMetadata<'a> {
    pub application_name: &'a str,
    pub tags: &'a BTreeMap<String, String>,
    pub start: Duration,
    pub end: Duration,
    /// Sampling frequency in Hz.
    pub sample_rate: u32,
    pub reporting_interval: Duration,
}

#[cfg(test)]
static EMPTY_TAGS: BTreeMap<String, String> = BTreeMap::new();

#[cfg(test)]
pub(crate) static DUMMY_METADATA: ReportMetadata<'static> = ReportMetadata {
    application_name: "dummy-app",
    tags: &EMPTY_TAGS,
    start: Duration::from_secs(1_700_000_000),
    end: Duration::from_secs(1_700_000_010),
    sample_rate: 100,
    reporting_interval: Duration::from_secs(10),
};
