// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use unified_profiling::config::{BackendKind, Config, SubscriberHandle};

fn make_subscriber(log_level: &str) -> SubscriberHandle {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer().pretty();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap();
    SubscriberHandle::new(tracing_subscriber::registry().with(format).with(filter))
}

/// Simple program to test the profiler
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "simple")]
    application_name: String,
    /// `remote-push` or `local-sampling`
    #[arg(long, default_value = "local-sampling")]
    backend: BackendKind,
    #[arg(long, default_value = unified_profiling::config::DEFAULT_SERVER_ADDRESS)]
    server_address: String,
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    duration: Duration,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    upload_interval: Duration,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = Config::new(args.application_name)
        .with_backend(args.backend)
        .with_server_address(args.server_address)
        .with_output_dir(args.output_dir)
        .with_upload_interval(args.upload_interval)
        .with_log_level(args.log_level.clone())
        .with_tag("demo", "simple")
        .with_tracing_subscriber(make_subscriber(&args.log_level));

    let lifecycle = unified_profiling::initialize(config).await?;
    tracing::info!(running = unified_profiling::is_running(), "profiler started");

    let deadline = tokio::time::Instant::now() + args.duration;
    let mut round = 0u64;
    while tokio::time::Instant::now() < deadline && !lifecycle.is_cancelled() {
        let route = if round % 2 == 0 { "/fast" } else { "/slow" };
        let depth = if round % 2 == 0 { 25 } else { 30 };
        let span = tracing::info_span!("request", route);
        let value = tokio::task::spawn_blocking(move || {
            let _span = span.entered();
            unified_profiling::tag_wrapper(None, "route", route, |_ctx| {
                Ok::<_, unified_profiling::Error>(fib(depth))
            })
        })
        .await??;
        tracing::debug!(round, route, value, "request done");
        round += 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tracing::info!(rounds = round, "stopping profiler");
    unified_profiling::stop().await?;
    Ok(())
}
