// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Profiling configuration.
//!
//! A [`Config`] is an immutable snapshot handed to a
//! [`ProfilerManager`](crate::manager::ProfilerManager). It can be built in code
//! with the `with_*` setters, or deserialized from JSON, in which case every
//! field that is absent inherits its default.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Subscriber;

/// Default address of the ingest server used by the remote-push backend.
pub const DEFAULT_SERVER_ADDRESS: &str = "http://127.0.0.1:4040";
/// Default resident memory ceiling, in MB.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 50;
/// Default timeout applied to every backend operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default CPU sampling frequency, in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 100;
/// Default interval at which collected samples are flushed to the backend's sink.
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_OUTPUT_DIR: &str = ".";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("application name not provided")]
    MissingApplicationName,
    #[error("server address not provided for backend {0}")]
    MissingServerAddress(BackendKind),
    #[error("unknown backend type: {0}")]
    UnknownBackend(String),
    #[error("unknown profile type: {0}")]
    UnknownProfileType(String),
    #[error("parsing configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// The profiling engine a [`ProfilerManager`](crate::manager::ProfilerManager)
/// instantiates during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum BackendKind {
    /// Ships samples to a Pyroscope-compatible aggregation server.
    #[default]
    #[serde(alias = "pyroscope")]
    RemotePush,
    /// Samples in-process and writes the profiles to local files.
    #[serde(alias = "pprof")]
    LocalSampling,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::RemotePush => "remote-push",
            BackendKind::LocalSampling => "local-sampling",
        }
    }

    /// Whether this backend needs a server address to run.
    pub fn requires_server(&self) -> bool {
        !matches!(self, BackendKind::LocalSampling)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "remote-push" | "pyroscope" => Ok(BackendKind::RemotePush),
            "local-sampling" | "pprof" => Ok(BackendKind::LocalSampling),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

/// A kind of profile a backend may collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    Cpu,
    AllocObjects,
    AllocSpace,
    InuseObjects,
    InuseSpace,
    Goroutines,
    MutexCount,
    MutexDuration,
    BlockCount,
    BlockDuration,
}

impl ProfileType {
    /// Every profile type, in declaration order.
    pub const ALL: [ProfileType; 10] = [
        ProfileType::Cpu,
        ProfileType::AllocObjects,
        ProfileType::AllocSpace,
        ProfileType::InuseObjects,
        ProfileType::InuseSpace,
        ProfileType::Goroutines,
        ProfileType::MutexCount,
        ProfileType::MutexDuration,
        ProfileType::BlockCount,
        ProfileType::BlockDuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::AllocObjects => "alloc_objects",
            ProfileType::AllocSpace => "alloc_space",
            ProfileType::InuseObjects => "inuse_objects",
            ProfileType::InuseSpace => "inuse_space",
            ProfileType::Goroutines => "goroutines",
            ProfileType::MutexCount => "mutex_count",
            ProfileType::MutexDuration => "mutex_duration",
            ProfileType::BlockCount => "block_count",
            ProfileType::BlockDuration => "block_duration",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ProfileType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownProfileType(s.to_owned()))
    }
}

/// Whether profiling starts as soon as the manager is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfilingState {
    #[default]
    Enabled,
    Disabled,
}

/// A pre-existing tracing subscriber that [`initialize`](crate::initialize)
/// wraps with the [`ProfilingLayer`](crate::tagging::layer::ProfilingLayer)
/// and installs as the global default.
#[derive(Clone)]
pub struct SubscriberHandle(Arc<dyn Subscriber + Send + Sync>);

impl SubscriberHandle {
    pub fn new(subscriber: impl Subscriber + Send + Sync + 'static) -> Self {
        SubscriberHandle(Arc::new(subscriber))
    }

    pub(crate) fn into_inner(self) -> Arc<dyn Subscriber + Send + Sync> {
        self.0
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubscriberHandle").finish_non_exhaustive()
    }
}

/// Profiling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the profiled application. Required.
    pub application_name: String,
    pub backend: BackendKind,
    /// Address of the ingest server. Required unless the backend is
    /// [`BackendKind::LocalSampling`].
    pub server_address: String,
    /// Static tags attached to every uploaded profile.
    pub tags: BTreeMap<String, String>,
    pub profile_types: BTreeSet<ProfileType>,
    pub initial_state: ProfilingState,
    /// Resident memory ceiling in MB checked before a backend starts. 0 disables the check.
    pub memory_limit_mb: u64,
    /// A `tracing` filter directive, used by applications setting up their subscriber.
    pub log_level: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub enable_tls: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub skip_tls_verify: bool,
    /// Opaque attributes carried along with the configuration.
    pub additional_attrs: Vec<serde_json::Value>,
    #[serde(skip)]
    pub tracing_subscriber: Option<SubscriberHandle>,
    /// CPU sampling frequency in Hz.
    pub sample_rate: u32,
    #[serde(with = "humantime_serde")]
    pub upload_interval: Duration,
    /// Directory the local-sampling backend writes its profiles to.
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            application_name: String::new(),
            backend: BackendKind::default(),
            server_address: DEFAULT_SERVER_ADDRESS.to_owned(),
            tags: BTreeMap::new(),
            profile_types: ProfileType::ALL.into_iter().collect(),
            initial_state: ProfilingState::default(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            skip_tls_verify: false,
            additional_attrs: Vec::new(),
            tracing_subscriber: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl Config {
    /// A configuration with every default and the given application name.
    pub fn new(application_name: impl Into<String>) -> Self {
        Config {
            application_name: application_name.into(),
            ..Config::default()
        }
    }

    /// Parses a JSON document. Absent fields inherit their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_profile_types(mut self, types: impl IntoIterator<Item = ProfileType>) -> Self {
        self.profile_types = types.into_iter().collect();
        self
    }

    pub fn with_initial_state(mut self, state: ProfilingState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_memory_limit_mb(mut self, limit_mb: u64) -> Self {
        self.memory_limit_mb = limit_mb;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables TLS towards the ingest server, optionally with a client
    /// certificate and key (both PEM).
    pub fn with_tls(mut self, cert_path: Option<PathBuf>, key_path: Option<PathBuf>) -> Self {
        self.enable_tls = true;
        self.tls_cert_path = cert_path;
        self.tls_key_path = key_path;
        self
    }

    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    pub fn with_additional_attrs(mut self, attrs: Vec<serde_json::Value>) -> Self {
        self.additional_attrs = attrs;
        self
    }

    pub fn with_tracing_subscriber(mut self, subscriber: SubscriberHandle) -> Self {
        self.tracing_subscriber = Some(subscriber);
        self
    }

    pub fn with_sample_rate(mut self, hz: u32) -> Self {
        self.sample_rate = hz;
        self
    }

    pub fn with_upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = interval;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Checks the invariants a manager relies on before touching any backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.trim().is_empty() {
            return Err(ConfigError::MissingApplicationName);
        }
        if self.server_address.trim().is_empty() && self.backend.requires_server() {
            return Err(ConfigError::MissingServerAddress(self.backend));
        }
        Ok(())
    }

    /// Fills every unset field (empty string, empty set or zero duration) with
    /// its default. The application name is never defaulted, and a memory limit
    /// of 0 keeps meaning "unlimited".
    pub fn with_defaults(mut self) -> Self {
        let defaults = Config::default();
        if self.server_address.trim().is_empty() {
            self.server_address = defaults.server_address;
        }
        if self.profile_types.is_empty() {
            self.profile_types = defaults.profile_types;
        }
        if self.log_level.trim().is_empty() {
            self.log_level = defaults.log_level;
        }
        if self.timeout.is_zero() {
            self.timeout = defaults.timeout;
        }
        if self.sample_rate == 0 {
            self.sample_rate = defaults.sample_rate;
        }
        if self.upload_interval.is_zero() {
            self.upload_interval = defaults.upload_interval;
        }
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = defaults.output_dir;
        }
        self
    }
}

/// The configuration shape of the first releases, kept so existing callers
/// can migrate with [`init_legacy`](crate::init_legacy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub application_name: String,
    pub server_address: String,
    /// `"pprof"` selects local sampling; anything else selects remote push.
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: BTreeMap<String, String>,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        LegacyConfig {
            application_name: "my-app".to_owned(),
            server_address: "127.0.0.1:4040".to_owned(),
            kind: "pyroscope".to_owned(),
            tags: BTreeMap::new(),
        }
    }
}

impl LegacyConfig {
    pub fn into_config(self, additional_attrs: Vec<serde_json::Value>) -> Config {
        let backend = if self.kind == "pprof" {
            BackendKind::LocalSampling
        } else {
            BackendKind::RemotePush
        };
        Config {
            application_name: self.application_name,
            server_address: self.server_address,
            backend,
            tags: self.tags,
            profile_types: ProfileType::ALL.into_iter().collect(),
            initial_state: ProfilingState::Enabled,
            additional_attrs,
            ..Config::default()
        }
    }
}
