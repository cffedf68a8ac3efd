//! Runs a single [`onyx_background::Worker`] until signalled, honoring its
//! configurable tunables. `dotenv` first, then `tracing_config::configure`,
//! then `structopt`-parsed args driving construction, the same entry-point
//! shape used elsewhere in this family of services.

use std::time::Duration;

use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};

use onyx_background::config::{Config, WorkerConfig, DEFAULT_NAMESPACE};
use onyx_background::worker::{StopOptions, Worker};
use onyx_background::Error;

#[derive(Debug, StructOpt)]
struct Args {
    /// Comma-separated list of ready queues to consume.
    #[structopt(short = "q", long, use_delimiter = true, default_value = "default")]
    queue: Vec<String>,

    #[structopt(short = "r", long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[structopt(short = "n", long)]
    namespace: Option<String>,

    /// Max concurrent in-flight attempts; defaults to `ONYX_FIBERS` or 100.
    #[structopt(long)]
    fibers: Option<usize>,

    /// Milliseconds to wait for in-flight attempts to drain before force-killing
    /// on shutdown. Omit to force-kill immediately on signal.
    #[structopt(long)]
    fibers_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    onyx_background::tracing_config::configure("onyx-worker");

    let args = Args::from_args();
    let config = match args.redis_url {
        Some(ref url) => Config::with_namespace(
            url.clone(),
            args.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        ),
        None => Config::from_env()?,
    };

    let mut worker_config = WorkerConfig::default();
    if let Some(fibers) = args.fibers {
        worker_config.fibers = fibers;
    }

    let worker = Worker::new(&config, worker_config, args.queue).await?;

    let stop_worker = worker.clone();
    let stop_opts = StopOptions {
        force_kill: args.fibers_timeout.is_none(),
        fibers_timeout: args.fibers_timeout.map(Duration::from_millis),
    };
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        if let Err(e) = stop_worker.stop(stop_opts).await {
            tracing::event!(tracing::Level::ERROR, error = %e, "Worker::stop failed");
        }
    });

    worker.run().await
}
