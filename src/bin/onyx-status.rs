//! `onyx-status`: a read-only CLI snapshot of queue depth and activity. A
//! `structopt`-driven binary that opens one connection and issues a handful
//! of read commands against the same key layout the rest of the crate
//! writes.

use std::process::exit;

use chrono::Utc;
use redis::Client;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

use onyx_background::keys::{client_names, Keys};
use onyx_background::Error;

#[derive(Debug, StructOpt)]
#[structopt(name = "onyx-status")]
struct Args {
    /// Comma-separated list of queues to report on.
    #[structopt(short = "q", long, use_delimiter = true, default_value = "default")]
    queue: Vec<String>,

    #[structopt(short = "r", long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[structopt(short = "n", long, default_value = "onyx-background")]
    namespace: String,

    #[structopt(short = "v", long)]
    verbose: bool,
}

struct Row {
    workers: usize,
    fibers: usize,
    jps: i64,
    ready: i64,
    scheduled: i64,
    processing: i64,
    completed: i64,
    failed: i64,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args = match Args::from_args_safe() {
        Ok(args) => args,
        Err(e) if e.kind == ErrorKind::HelpDisplayed || e.kind == ErrorKind::VersionDisplayed => {
            print!("{}", e.message);
            exit(0);
        }
        Err(e) => {
            eprintln!("{}", e.message);
            exit(1);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("onyx-status: {}", e);
        exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    if args.verbose {
        onyx_background::tracing_config::configure("onyx-status");
    }

    let redis_url = match args.redis_url {
        Some(url) => url,
        None => std::env::var("REDIS_URL").map_err(|_| Error::Config("REDIS_URL is required".into()))?,
    };

    let client = Client::open(redis_url)?;
    let mut conn = client.get_async_connection().await?;
    let keys = Keys::new(args.namespace);

    let client_list: String = redis::cmd("CLIENT")
        .arg("LIST")
        .arg("TYPE")
        .arg("normal")
        .query_async(&mut conn)
        .await?;
    let (workers, fibers) = count_clients(&client_list);

    let now_ms = Utc::now().timestamp_millis();
    let window_start = now_ms - 1000;

    println!("workers\tfibers\tjps\tready\tscheduled\tprocessing\tcompleted\tfailed");
    for queue in &args.queue {
        let (ready, scheduled, processing, completed, failed, jps): (i64, i64, i64, i64, i64, i64) =
            redis::pipe()
                .llen(keys.ready(queue))
                .zcard(keys.scheduled(queue))
                .scard(keys.processing(queue))
                .zcard(keys.completed(queue))
                .zcard(keys.failed(queue))
                .zcount(keys.completed(queue), window_start, now_ms)
                .query_async(&mut conn)
                .await?;

        let row = Row {
            workers,
            fibers,
            jps,
            ready,
            scheduled,
            processing,
            completed,
            failed,
        };
        print_row(&row);
    }

    Ok(())
}

fn print_row(row: &Row) {
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        row.workers, row.fibers, row.jps, row.ready, row.scheduled, row.processing, row.completed, row.failed
    );
}

/// Counts `CLIENT LIST` entries whose name matches the worker or
/// worker-fiber prefix.
fn count_clients(client_list: &str) -> (usize, usize) {
    let mut workers = 0;
    let mut fibers = 0;
    for line in client_list.lines() {
        for field in line.split_whitespace() {
            if let Some(name) = field.strip_prefix("name=") {
                if name.starts_with(client_names::FIBER_PREFIX) {
                    fibers += 1;
                } else if name.starts_with(client_names::WORKER_PREFIX) {
                    workers += 1;
                }
                break;
            }
        }
    }
    (workers, fibers)
}
