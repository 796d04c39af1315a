// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};

use crate::tagging::labels::LabelSet;

/// One collected call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSample {
    /// Id of the thread the stack was sampled on.
    pub thread_id: u64,
    /// Frames from the outermost to the innermost, separated by `;`.
    pub stack: String,
    pub count: u64,
}

/// CPU samples collected over one reporting interval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldedProfile {
    samples: Vec<StackSample>,
}

impl FoldedProfile {
    pub fn new(samples: Vec<StackSample>) -> Self {
        FoldedProfile { samples }
    }

    pub fn samples(&self) -> &[StackSample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.iter().all(|s| s.count == 0)
    }

    pub fn total_samples(&self) -> u64 {
        self.samples.iter().map(|s| s.count).sum()
    }

    /// Renders the profile in the collapsed-stack format, one `stack count`
    /// line per distinct stack, sorted by stack.
    pub fn to_folded(&self) -> String {
        let mut merged: BTreeMap<&str, u64> = BTreeMap::new();
        for sample in &self.samples {
            if sample.count > 0 {
                *merged.entry(sample.stack.as_str()).or_default() += sample.count;
            }
        }
        let mut out = String::new();
        for (stack, count) in merged {
            out.push_str(stack);
            out.push(' ');
            out.push_str(&count.to_string());
            out.push('\n');
        }
        out
    }

    /// Groups samples by the labels their thread carried. Samples of
    /// unlabelled threads end up under the empty label set.
    pub fn split_by_labels(
        self,
        thread_labels: &HashMap<u64, LabelSet>,
    ) -> Vec<(LabelSet, FoldedProfile)> {
        let mut groups: BTreeMap<LabelSet, Vec<StackSample>> = BTreeMap::new();
        for sample in self.samples {
            let labels = thread_labels
                .get(&sample.thread_id)
                .cloned()
                .unwrap_or_default();
            groups.entry(labels).or_default().push(sample);
        }
        groups
            .into_iter()
            .map(|(labels, samples)| (labels, FoldedProfile::new(samples)))
            .collect()
    }
}
