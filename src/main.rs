use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use durable_sequence::providers::in_memory::InMemoryInstanceStore;
use durable_sequence::runtime::activity::RetryPolicy;
use durable_sequence::runtime::observability::{init_logging, LogFormat, ObservabilityConfig};
use durable_sequence::runtime::{Runtime, RuntimeOptions};
use durable_sequence::{samples, server};

#[derive(Debug, Parser)]
#[command(name = "durable-sequence", about = "Sequential durable orchestrations over HTTP")]
struct Args {
    #[arg(long, env = "DURABLE_SEQUENCE_LISTEN", default_value = "127.0.0.1:7071")]
    listen: SocketAddr,
    #[arg(long, env = "DURABLE_SEQUENCE_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,
    #[arg(long, env = "DURABLE_SEQUENCE_LOG_LEVEL", default_value = "info")]
    log_level: String,
    /// Per-attempt activity deadline; 0 disables it.
    #[arg(long, env = "DURABLE_SEQUENCE_ACTIVITY_TIMEOUT_MS", default_value_t = 30_000)]
    activity_timeout_ms: u64,
    #[arg(
        long,
        env = "DURABLE_SEQUENCE_ACTIVITY_MAX_ATTEMPTS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    activity_max_attempts: u32,
}

impl Args {
    fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            activity_timeout: (self.activity_timeout_ms > 0).then(|| Duration::from_millis(self.activity_timeout_ms)),
            activity_retry: RetryPolicy::new(self.activity_max_attempts),
            ..RuntimeOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Err(e) = init_logging(&ObservabilityConfig {
        log_format: args.log_format,
        log_level: args.log_level.clone(),
    }) {
        eprintln!("logging disabled: {e}");
    }

    let store = Arc::new(InMemoryInstanceStore::new());
    let runtime = Runtime::start_with_options(store, samples::activities(), args.runtime_options());
    let app = server::router(runtime.clone());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %args.listen, "durable-sequence listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server terminated with error")?;

    runtime.shutdown().await;
    Ok(())
}
