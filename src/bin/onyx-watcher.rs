//! Runs a single [`onyx_background::Watcher`] until signalled. Intended to
//! run as a singleton per namespace; nothing here prevents running a
//! second one (see DESIGN.md for why that's an accepted gap).

use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};

use onyx_background::config::{Config, WatcherConfig, DEFAULT_NAMESPACE};
use onyx_background::Error;
use onyx_background::Watcher;

#[derive(Debug, StructOpt)]
struct Args {
    #[structopt(short = "q", long, use_delimiter = true, default_value = "default")]
    queue: Vec<String>,

    #[structopt(short = "r", long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[structopt(short = "n", long)]
    namespace: Option<String>,

    /// Tick interval in milliseconds; defaults to `ONYX_WATCHER_INTERVAL_MS` or 1000.
    #[structopt(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    onyx_background::tracing_config::configure("onyx-watcher");

    let args = Args::from_args();
    let config = match args.redis_url {
        Some(ref url) => Config::with_namespace(
            url.clone(),
            args.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        ),
        None => Config::from_env()?,
    };

    let mut watcher_config = WatcherConfig::default();
    if let Some(interval) = args.interval {
        watcher_config.interval = std::time::Duration::from_millis(interval);
    }

    let watcher = Watcher::new(&config, watcher_config, args.queue)?;

    let stop_watcher = watcher.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        stop_watcher.stop();
    });

    watcher.run().await
}
