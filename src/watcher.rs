//! The Watcher: promotes due scheduled jobs and reclaims attempts whose
//! fiber connection has vanished.
//!
//! A `tokio::spawn`ed loop on a fixed `tokio::time::interval` that logs its
//! own outcome each tick and keeps going on error, the same shape as the
//! scheduled-jobs enqueuer task elsewhere in this family of services,
//! generalized to also run the stale-attempt sweep.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use redis::aio::Connection;
use redis::{AsyncCommands, Client};
use tracing::{event, Level};
use uuid::Uuid;

use crate::config::{Config, WatcherConfig};
use crate::error::{Error, Result};
use crate::keys::{client_names, Keys};

const WORKER_TIMEOUT_ERR: &str = "Worker Timeout";

struct Inner {
    client: Client,
    keys: Keys,
    queues: Vec<String>,
    interval: std::time::Duration,
    stopping: AtomicBool,
}

/// Intended to run as a singleton per namespace; nothing in this crate
/// prevents a second instance (see DESIGN.md for why that's an accepted
/// gap rather than an oversight).
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

impl Watcher {
    pub fn new(config: &Config, watcher_config: WatcherConfig, queues: Vec<String>) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::Config("Watcher requires at least one queue".into()));
        }
        let client = Client::open(config.redis_url.as_str())?;
        Ok(Watcher {
            inner: Arc::new(Inner {
                client,
                keys: Keys::new(config.namespace.clone()),
                queues,
                interval: watcher_config.interval,
                stopping: AtomicBool::new(false),
            }),
        })
    }

    /// Marks the Watcher for shutdown. Takes effect at the next tick
    /// boundary, bounded by `interval`.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
    }

    pub async fn run(&self) -> Result<()> {
        let mut conn = self.inner.client.get_async_connection().await?;
        let name = client_names::WATCHER;
        redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(name)
            .query_async(&mut conn)
            .await?;

        event!(Level::INFO, queues = %self.inner.queues.join(","), "Watcher starting");

        while !self.inner.stopping.load(Ordering::Acquire) {
            if let Err(e) = self.reclaim_stale_attempts(&mut conn).await {
                event!(Level::ERROR, error = %e, "Stale-attempt reclamation failed");
            }
            if let Err(e) = self.promote_scheduled(&mut conn).await {
                event!(Level::ERROR, error = %e, "Scheduled promotion failed");
            }
            tokio::time::sleep(self.inner.interval).await;
        }

        event!(Level::INFO, "Watcher stopped");
        Ok(())
    }

    async fn reclaim_stale_attempts(&self, conn: &mut Connection) -> Result<()> {
        let keys = &self.inner.keys;

        // CLIENT LIST and every queue's processing members must be read as
        // one snapshot: a fiber that SADDs into `processing` between two
        // separate reads would be invisible in the live-fiber set while
        // already in-flight, and get falsely reclaimed.
        let mut read_pipe = redis::pipe();
        read_pipe.atomic();
        read_pipe.cmd("CLIENT").arg("LIST").arg("TYPE").arg("normal");
        for queue in &self.inner.queues {
            read_pipe.smembers(keys.processing(queue));
        }
        let results: Vec<redis::Value> = read_pipe.query_async(&mut *conn).await?;
        let mut results = results.into_iter();

        let client_list: String = redis::from_redis_value(
            &results.next().expect("CLIENT LIST reply always present"),
        )?;
        let live_fibers = parse_live_fiber_ids(&client_list);

        let mut processing_by_queue: HashMap<String, Vec<String>> = HashMap::new();
        for queue in &self.inner.queues {
            let value = results.next().expect("one SMEMBERS reply per queue");
            let members: Vec<String> = redis::from_redis_value(&value)?;
            processing_by_queue.insert(queue.clone(), members);
        }

        let mut stale: Vec<(String, Uuid)> = Vec::new();
        for (queue, attempt_ids) in &processing_by_queue {
            for attempt_id in attempt_ids {
                let attempt_uuid = match Uuid::parse_str(attempt_id) {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                let wrk: Option<String> = conn.hget(keys.attempt(attempt_uuid), "wrk").await?;
                let wrk = match wrk {
                    Some(wrk) => wrk,
                    None => {
                        event!(Level::ERROR, attempt = %attempt_uuid, "BUG: in-flight attempt has no wrk field");
                        continue;
                    }
                };
                let live = wrk.parse::<i64>().map(|id| live_fibers.contains(&id)).unwrap_or(false);
                if !live {
                    stale.push((queue.clone(), attempt_uuid));
                }
            }
        }

        if stale.is_empty() {
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (queue, attempt_uuid) in &stale {
            pipe.hset(keys.attempt(*attempt_uuid), "err", WORKER_TIMEOUT_ERR).ignore();
            pipe.srem(keys.processing(queue), attempt_uuid.to_string()).ignore();
            pipe.zadd(keys.failed(queue), attempt_uuid.to_string(), now_ms).ignore();
        }
        pipe.query_async(conn).await?;

        event!(Level::WARN, count = stale.len(), "Reclaimed stale attempts");
        Ok(())
    }

    async fn promote_scheduled(&self, conn: &mut Connection) -> Result<()> {
        let keys = &self.inner.keys;
        let now_ms = Utc::now().timestamp_millis();

        for queue in &self.inner.queues {
            let due: Vec<String> = conn
                .zrangebyscore(keys.scheduled(queue), 0, now_ms)
                .await?;
            if due.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for job_uuid in &due {
                pipe.zrem(keys.scheduled(queue), job_uuid).ignore();
                pipe.rpush(keys.ready(queue), job_uuid).ignore();
            }
            pipe.query_async(conn).await?;

            event!(Level::INFO, queue = %queue, count = due.len(), "Promoted scheduled jobs");
        }

        Ok(())
    }
}

/// Parses `CLIENT LIST TYPE normal` output, returning the ids of entries
/// whose `name` matches `onyx-background-worker-fiber:<anything>` — the
/// live-fiber set.
fn parse_live_fiber_ids(client_list: &str) -> HashSet<i64> {
    let mut ids = HashSet::new();
    for line in client_list.lines() {
        let mut id: Option<i64> = None;
        let mut is_fiber = false;
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix("id=") {
                id = value.parse().ok();
            } else if let Some(value) = field.strip_prefix("name=") {
                if value.starts_with(client_names::FIBER_PREFIX) {
                    is_fiber = true;
                }
            }
        }
        if is_fiber {
            if let Some(id) = id {
                ids.insert(id);
            }
        }
    }
    ids
}
