//! The Worker: consumes ready queues, executes jobs across a bounded fiber
//! pool, and records attempts.
//!
//! The main loop maps one `tokio::task` to the single blocking `BLPOP`
//! consumer, and spawns one more `tokio::task` per popped job — a fiber per
//! job on a cooperatively scheduled runtime, the same `tokio::spawn`ed loop
//! handing work off to further spawned tasks used elsewhere in this family
//! of services.

pub mod attempt;
pub mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::aio::Connection;
use redis::Client;
use regex::Regex;
use tracing::{event, Level};

use crate::config::{Config, WorkerConfig};
use crate::error::{Error, Result};
use crate::keys::{client_names, Keys};

use self::pool::FiberPool;

/// Options for [`Worker::stop`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StopOptions {
    /// Immediately kill every fiber connection rather than waiting for
    /// in-flight attempts to finish.
    pub force_kill: bool,
    /// If set (and `force_kill` is false), wait up to this long for
    /// in-flight attempts to drain before force-killing anyway.
    pub fibers_timeout: Option<Duration>,
}

struct Inner {
    client: Client,
    keys: Keys,
    queues: Vec<String>,
    ready_keys: Vec<String>,
    ready_pattern: Regex,
    worker_client_id: i64,
    pool: FiberPool,
    main_conn: Mutex<Option<Connection>>,
    running: AtomicBool,
    stopping: AtomicBool,
}

/// A long-running consumer of one or more ready queues.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub async fn new(config: &Config, worker_config: WorkerConfig, queues: Vec<String>) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::Config("Worker requires at least one queue".into()));
        }

        let client = Client::open(config.redis_url.as_str())?;
        let mut main_conn = client.get_async_connection().await?;

        let queues_csv = queues.join(",");
        let name = client_names::worker(&queues_csv);
        let (worker_client_id,): (i64,) = redis::pipe()
            .atomic()
            .cmd("CLIENT").arg("SETNAME").arg(&name).ignore()
            .cmd("CLIENT").arg("ID")
            .query_async(&mut main_conn)
            .await?;

        let keys = Keys::new(config.namespace.clone());
        let ready_keys: Vec<String> = queues.iter().map(|q| keys.ready(q)).collect();
        let ready_pattern = Regex::new(&format!("^{}(\\w+)$", regex::escape(&keys.ready_prefix())))
            .expect("static regex is valid");

        let pool = FiberPool::new(client.clone(), worker_client_id, worker_config);

        Ok(Worker {
            inner: Arc::new(Inner {
                client,
                keys,
                queues,
                ready_keys,
                ready_pattern,
                worker_client_id,
                pool,
                main_conn: Mutex::new(Some(main_conn)),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    pub fn worker_client_id(&self) -> i64 {
        self.inner.worker_client_id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Runs the main loop until `stop` is called or an unrecoverable
    /// datastore error occurs. Calling `run` twice, or after `stop`, is a
    /// misuse error.
    pub async fn run(&self) -> Result<()> {
        let mut conn = self
            .inner
            .main_conn
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Misuse("Worker::run called while already running"))?;

        self.inner.running.store(true, Ordering::Release);
        self.spawn_reaper();

        event!(Level::INFO, queues = %self.inner.queues.join(","), "Worker starting");

        loop {
            if self.inner.stopping.load(Ordering::Acquire) {
                break;
            }

            let mut cmd = redis::cmd("BLPOP");
            for key in &self.inner.ready_keys {
                cmd.arg(key);
            }
            cmd.arg(0);

            let popped: std::result::Result<(String, String), redis::RedisError> =
                cmd.query_async(&mut conn).await;

            match popped {
                Ok((key, job_uuid)) => {
                    let queue = self
                        .inner
                        .ready_pattern
                        .captures(&key)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| key.clone());

                    let job_uuid = match uuid::Uuid::parse_str(&job_uuid) {
                        Ok(id) => id,
                        Err(e) => {
                            event!(Level::ERROR, error = %e, value = %job_uuid, "Popped a non-UUID job id, dropping");
                            continue;
                        }
                    };

                    self.spawn_attempt(queue, job_uuid);
                }
                Err(e) if e.to_string().starts_with("UNBLOCKED") => {
                    event!(Level::INFO, "Main connection unblocked for shutdown");
                    break;
                }
                Err(e) => {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(e.into());
                }
            }
        }

        self.inner.running.store(false, Ordering::Release);
        event!(Level::INFO, "Stopped");
        Ok(())
    }

    fn spawn_attempt(&self, queue: String, job_uuid: uuid::Uuid) {
        let inner = self.inner.clone();
        let keys = self.inner.keys.clone();
        tokio::spawn(async move {
            let mut fiber = match inner.pool.acquire().await {
                Ok(fiber) => fiber,
                Err(e) => {
                    event!(Level::ERROR, error = %e, "Failed to acquire fiber connection");
                    return;
                }
            };

            if let Err(e) = attempt::run_attempt(&mut fiber, &keys, &queue, job_uuid).await {
                event!(Level::ERROR, job = %job_uuid, queue = %queue, error = %e, "Attempt bookkeeping failed; job may be stuck in processing until reclaimed");
            }

            inner.pool.release(fiber);
        });
    }

    fn spawn_reaper(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while !inner.stopping.load(Ordering::Acquire) {
                tokio::time::sleep(pool::default_reap_interval()).await;
                inner.pool.reap_idle();
            }
        });
    }

    /// Requests a clean or forced shutdown. Returns
    /// once the shutdown procedure itself has been issued; `run` still has
    /// to observe it and return.
    pub async fn stop(&self, opts: StopOptions) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::Misuse("stop called on a Worker that is not running"));
        }
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return Err(Error::Misuse("stop called twice"));
        }

        let mut aux_conn = self.inner.client.get_async_connection().await?;
        let unblock: std::result::Result<i64, redis::RedisError> = redis::cmd("CLIENT")
            .arg("UNBLOCK")
            .arg(self.inner.worker_client_id)
            .arg("ERROR")
            .query_async(&mut aux_conn)
            .await;
        if let Err(e) = unblock {
            event!(Level::WARN, error = %e, "CLIENT UNBLOCK of main connection failed");
        }

        if opts.force_kill {
            self.inner.pool.clear(&mut aux_conn).await;
        } else if let Some(timeout) = opts.fibers_timeout {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.inner.pool.in_use_count() == 0 {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    event!(Level::WARN, "fibers_timeout elapsed with fibers still in use, force-killing");
                    self.inner.pool.clear(&mut aux_conn).await;
                    break;
                }
                tokio::time::sleep(self.inner.pool.fibers_check_interval()).await;
            }
        }

        Ok(())
    }
}
