// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serial_test::serial;
use unified_profiling::{
    config::{BackendKind, Config, ConfigError, LegacyConfig, ProfileType},
    manager::ManagerError,
    tagging::labels,
    Error,
};

// Non-CPU kinds start no sampler, which keeps these tests free of SIGPROF.
fn local_config(dir: &std::path::Path) -> Config {
    Config::new("svc")
        .with_backend(BackendKind::LocalSampling)
        .with_profile_types([ProfileType::InuseSpace, ProfileType::MutexCount])
        .with_memory_limit_mb(0)
        .with_output_dir(dir)
}

#[tokio::test]
#[serial]
async fn test_uninitialized_facade() {
    assert!(!unified_profiling::is_running());
    unified_profiling::stop().await.unwrap();
    assert!(matches!(
        unified_profiling::start().await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        unified_profiling::add_tag("k", "v"),
        Err(Error::NotInitialized)
    ));
    let res: Result<(), Error> = unified_profiling::tag_wrapper(None, "k", "v", |_| Ok(()));
    assert!(matches!(res, Err(Error::NotInitialized)));
    assert!(matches!(
        unified_profiling::wrap_subscriber(tracing_subscriber::registry()),
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
#[serial]
async fn test_initialize_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let lifecycle = unified_profiling::initialize(local_config(dir.path()))
        .await
        .unwrap();
    assert!(unified_profiling::is_running());
    assert!(matches!(
        unified_profiling::initialize(local_config(dir.path())).await,
        Err(Error::AlreadyInitialized)
    ));

    // local sampling has no runtime tagging, so tagging is a no-op
    unified_profiling::add_tag("region", "eu").unwrap();
    let res: Result<u32, Error> =
        unified_profiling::tag_wrapper(None, "route", "/a", |ctx| {
            assert!(!ctx.is_cancelled());
            Ok(3)
        });
    assert_eq!(res.unwrap(), 3);
    assert!(labels::current().get("route").is_none());

    unified_profiling::pause().await.unwrap();
    assert!(!unified_profiling::is_running());
    unified_profiling::resume().await.unwrap();
    assert!(unified_profiling::is_running());

    unified_profiling::stop().await.unwrap();
    assert!(!unified_profiling::is_running());
    assert!(lifecycle.is_cancelled());
    assert!(unified_profiling::active_manager().is_none());
    unified_profiling::stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_failed_initialize_installs_nothing() {
    let err = unified_profiling::initialize(Config::new("  "))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Manager(ManagerError::Config(ConfigError::MissingApplicationName))
    ));
    assert!(!unified_profiling::is_running());
    assert!(unified_profiling::active_manager().is_none());
}

#[tokio::test]
#[serial]
async fn test_initialize_applies_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(dir.path());
    config.timeout = Duration::ZERO;
    config.log_level = String::new();
    unified_profiling::initialize(config).await.unwrap();

    let manager = unified_profiling::active_manager().unwrap();
    assert_eq!(manager.config().timeout, Duration::from_secs(10));
    assert_eq!(manager.config().log_level, "info");
    assert_eq!(
        manager.config().profile_types.len(),
        2,
        "explicit profile types are kept"
    );
    unified_profiling::stop().await.unwrap();
}

#[cfg(feature = "remote-push")]
#[tokio::test]
#[serial]
async fn test_remote_push_tagging_and_subscriber() {
    let config = Config::new("svc")
        .with_backend(BackendKind::RemotePush)
        .with_server_address("127.0.0.1:4040")
        .with_profile_types([ProfileType::AllocObjects])
        .with_memory_limit_mb(0);
    unified_profiling::initialize(config).await.unwrap();
    assert!(unified_profiling::is_running());

    let res: Result<(), Error> = unified_profiling::tag_wrapper(None, "route", "/b", |_| {
        assert_eq!(labels::current().get("route"), Some("/b"));
        Ok(())
    });
    res.unwrap();
    assert!(labels::current().get("route").is_none());
    assert!(matches!(
        unified_profiling::add_tag("", "v"),
        Err(Error::Tag(_))
    ));

    let subscriber = unified_profiling::wrap_subscriber(tracing_subscriber::registry()).unwrap();
    tracing::subscriber::with_default(subscriber, || {
        let span = tracing::info_span!("request");
        let _entered = span.enter();
        assert!(labels::current()
            .get(unified_profiling::tagging::layer::SPAN_ID_LABEL)
            .is_some());
    });

    unified_profiling::stop().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_init_legacy_local_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let legacy = LegacyConfig {
        application_name: "legacy-app".into(),
        kind: "pprof".into(),
        ..LegacyConfig::default()
    };
    let res = unified_profiling::init_legacy(legacy, vec![serde_json::json!({"team": "core"})]).await;
    let manager = unified_profiling::active_manager();
    let stopped = unified_profiling::stop().await;
    std::env::set_current_dir(cwd).unwrap();

    res.unwrap();
    stopped.unwrap();
    let manager = manager.unwrap();
    assert_eq!(manager.backend(), BackendKind::LocalSampling);
    assert_eq!(manager.config().profile_types.len(), ProfileType::ALL.len());
    assert_eq!(manager.config().additional_attrs.len(), 1);
    assert!(!manager.is_running());
}
