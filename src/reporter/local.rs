// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A reporter that writes collapsed stacks into a directory.

use async_trait::async_trait;
use chrono::SecondsFormat;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::{metadata::ReportMetadata, sampling::FoldedProfile};

use super::Reporter;

#[derive(Error, Debug)]
enum LocalReporterError {
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A reporter that writes one file per reporting interval into a directory.
///
/// Files are named `{application}.cpu.{yyyy-mm-ddTHH-MM-SS.sssZ}.folded`,
/// timestamped with the end of the interval they cover.
#[derive(Debug)]
pub struct LocalReporter {
    directory: PathBuf,
}

impl LocalReporter {
    /// Instantiate a new LocalReporter writing into the provided directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LocalReporter {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_name(metadata: &ReportMetadata<'_>) -> String {
        let time: chrono::DateTime<chrono::Utc> = (UNIX_EPOCH + metadata.end).into();
        let time = time
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace(":", "-");
        let application = metadata.application_name.replace(['/', '\\'], "_");
        format!("{application}.cpu.{time}.folded")
    }

    async fn report_profiling_data(
        &self,
        profile: FoldedProfile,
        metadata: &ReportMetadata<'_>,
    ) -> Result<(), LocalReporterError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| LocalReporterError::Write {
                path: self.directory.clone(),
                source,
            })?;
        let path = self.directory.join(Self::file_name(metadata));
        tracing::debug!(path = %path.display(), samples = profile.total_samples(), "writing profile");
        tokio::fs::write(&path, profile.to_folded())
            .await
            .map_err(|source| LocalReporterError::Write { path, source })?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for LocalReporter {
    async fn report(
        &self,
        profile: FoldedProfile,
        metadata: &ReportMetadata,
    ) -> Result<(), Box<dyn std::error::Error + Send>> {
        self.report_profiling_data(profile, metadata)
            .await
            .map_err(|e| Box::new(e) as _)
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use crate::{
        metadata::DUMMY_METADATA,
        reporter::{local::LocalReporter, Reporter},
        sampling::{FoldedProfile, StackSample},
    };

    #[tokio::test]
    async fn test_local_reporter() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("profiles");
        let reporter = LocalReporter::new(&out);
        let profile = FoldedProfile::new(vec![StackSample {
            thread_id: 1,
            stack: "main;work".into(),
            count: 3,
        }]);
        reporter.report(profile, &DUMMY_METADATA).await.unwrap();
        let folded = std::fs::read_dir(&out)
            .unwrap()
            .flat_map(|f| f.ok())
            .find(|f| {
                Path::new(&f.file_name())
                    .extension()
                    .is_some_and(|e| e == "folded")
            })
            .unwrap();
        assert_eq!(
            folded.file_name().to_string_lossy(),
            "dummy-app.cpu.2023-11-14T22-13-30.000Z.folded"
        );
        assert_eq!(
            tokio::fs::read_to_string(folded.path()).await.unwrap(),
            "main;work 3\n"
        );
    }
}
