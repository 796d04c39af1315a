// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use async_trait::async_trait;

use crate::{metadata::ReportMetadata, sampling::FoldedProfile};

#[cfg(feature = "remote-push")]
pub mod ingest;
pub mod local;

/// Destination of the profiles collected by a sampling session.
#[async_trait]
pub trait Reporter: fmt::Debug {
    async fn report(
        &self,
        profile: FoldedProfile,
        metadata: &ReportMetadata,
    ) -> Result<(), Box<dyn std::error::Error + Send>>;
}
