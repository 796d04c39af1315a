// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A reporter that pushes collapsed stacks to a remote aggregation server's
//! `/ingest` endpoint.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    metadata::ReportMetadata,
    sampling::FoldedProfile,
    tagging::labels::{self, LabelSet},
};

use super::Reporter;

const SPY_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    #[error("sending profile to {url}: {source}")]
    Send {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("ingest endpoint answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Pushes every reported profile to `{server}/ingest`.
///
/// Samples are grouped by the labels their thread carried when the report
/// was taken, and each group is uploaded as its own series, named
/// `{application}.cpu{tags}` where `tags` merges the configured static tags
/// with the group's labels.
#[derive(Debug, Clone)]
pub struct IngestReporter {
    client: reqwest::Client,
    url: String,
}

impl IngestReporter {
    pub fn new(client: reqwest::Client, server_address: &str) -> Self {
        IngestReporter {
            client,
            url: format!("{}/ingest", normalize_address(server_address)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn upload(
        &self,
        labels: &LabelSet,
        profile: &FoldedProfile,
        metadata: &ReportMetadata<'_>,
    ) -> Result<(), IngestError> {
        let name = series_name(metadata, labels);
        tracing::debug!(%name, samples = profile.total_samples(), "uploading profile");
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("name", name),
                ("from", metadata.start.as_secs().to_string()),
                ("until", metadata.end.as_secs().to_string()),
                ("sampleRate", metadata.sample_rate.to_string()),
                ("spyName", SPY_NAME.to_owned()),
                ("format", "folded".to_owned()),
                ("units", "samples".to_owned()),
                ("aggregationType", "sum".to_owned()),
            ])
            .body(profile.to_folded())
            .send()
            .await
            .map_err(|source| IngestError::Send {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl Reporter for IngestReporter {
    async fn report(
        &self,
        profile: FoldedProfile,
        metadata: &ReportMetadata,
    ) -> Result<(), Box<dyn std::error::Error + Send>> {
        let mut last_err = None;
        for (labels, profile) in profile.split_by_labels(&labels::snapshot()) {
            if let Err(err) = self.upload(&labels, &profile, metadata).await {
                tracing::warn!(?err, %labels, "failed to upload profile");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(Box::new(err)),
            None => Ok(()),
        }
    }
}

/// Adds a scheme to bare `host:port` addresses and strips trailing slashes.
fn normalize_address(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else {
        format!("http://{address}")
    }
}

fn series_name(metadata: &ReportMetadata<'_>, labels: &LabelSet) -> String {
    let mut tags: LabelSet = metadata
        .tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in labels.iter() {
        tags.insert(k, v);
    }
    if tags.is_empty() {
        format!("{}.cpu", metadata.application_name)
    } else {
        format!("{}.cpu{tags}", metadata.application_name)
    }
}
