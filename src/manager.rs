//! The Manager: enqueue and dequeue of jobs against the shared key layout.
//!
//! Builds a job-data command, pipelines it with the list/zset insert, and
//! runs both against a pooled connection, the same shape as
//! `Queue::enqueue`/`Queue::cancel_job` elsewhere in this family of
//! services. Dequeue needs only a plain `MULTI/EXEC` transaction; there is
//! no retry bookkeeping here, so there is nothing a server-side Lua script
//! would buy.

use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Pipeline};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_QUEUE};
use crate::error::{Error, Result};
use crate::keys::{client_names, Keys};

/// At most one of `in_` or `at` may be set; enqueue will reject both being present.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    pub in_: Option<chrono::Duration>,
    pub at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn in_duration(mut self, delay: chrono::Duration) -> Self {
        self.in_ = Some(delay);
        self
    }

    pub fn at_time(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    fn resolve(&self, now: DateTime<Utc>) -> Result<(String, Option<DateTime<Utc>>)> {
        if self.in_.is_some() && self.at.is_some() {
            return Err(Error::Config(
                "enqueue options may set `in` or `at`, not both".into(),
            ));
        }
        let queue = self.queue.clone().unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let pat = self.at.or_else(|| self.in_.map(|d| now + d));
        Ok((queue, pat))
    }
}

/// The Manager's writes go either through its own freshly acquired
/// connection (`enqueue`, which pipelines and executes) or onto a pipeline
/// the caller already owns (`enqueue_into`, which only appends commands),
/// so many enqueues can be batched into one round trip.
pub struct Manager {
    pool: deadpool_redis::Pool,
    keys: Keys,
}

impl Manager {
    pub fn new(pool: deadpool_redis::Pool, config: &Config) -> Self {
        Manager {
            pool,
            keys: Keys::new(config.namespace.clone()),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Enqueues one job, returning its fresh `job_uuid`.
    pub async fn enqueue(&self, class_id: &str, arg: &str, opts: EnqueueOptions) -> Result<Uuid> {
        let job_uuid = Uuid::new_v4();
        let now = Utc::now();
        let (queue, pat) = opts.resolve(now)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("CLIENT").arg("SETNAME").arg(client_names::MANAGER).ignore();
        self.build_enqueue(&mut pipe, job_uuid, class_id, arg, &queue, now, pat);

        let mut conn = self.pool.get().await?;
        pipe.query_async(&mut conn).await?;
        Ok(job_uuid)
    }

    /// Adds this job's writes onto a pipeline the caller controls, for
    /// batching many enqueues into one round trip. Does not execute the
    /// pipeline, and does not set the connection's client name — the
    /// caller owns that connection's lifecycle.
    pub fn enqueue_into(
        &self,
        pipe: &mut Pipeline,
        class_id: &str,
        arg: &str,
        opts: EnqueueOptions,
    ) -> Result<Uuid> {
        let job_uuid = Uuid::new_v4();
        let now = Utc::now();
        let (queue, pat) = opts.resolve(now)?;
        self.build_enqueue(pipe, job_uuid, class_id, arg, &queue, now, pat);
        Ok(job_uuid)
    }

    fn build_enqueue(
        &self,
        pipe: &mut Pipeline,
        job_uuid: Uuid,
        class_id: &str,
        arg: &str,
        queue: &str,
        now: DateTime<Utc>,
        pat: Option<DateTime<Utc>>,
    ) {
        let job_key = self.keys.job(job_uuid);
        let mut fields: Vec<(&str, String)> = vec![
            ("que", queue.to_string()),
            ("cls", class_id.to_string()),
            ("arg", arg.to_string()),
            ("qat", now.timestamp_millis().to_string()),
        ];
        if let Some(pat) = pat {
            fields.push(("pat", pat.timestamp_millis().to_string()));
        }
        pipe.hset_multiple(&job_key, &fields).ignore();

        match pat {
            Some(pat) => {
                pipe.zadd(self.keys.scheduled(queue), job_uuid.to_string(), pat.timestamp_millis())
                    .ignore();
            }
            None => {
                pipe.rpush(self.keys.ready(queue), job_uuid.to_string()).ignore();
            }
        }
    }

    /// Removes a job that has not yet been picked up by a Worker. Returns
    /// `true` iff it was still sitting in `ready` or `scheduled`.
    pub async fn dequeue(&self, job_uuid: Uuid) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let job_key = self.keys.job(job_uuid);

        let que: Option<String> = redis::pipe()
            .cmd("CLIENT").arg("SETNAME").arg(client_names::MANAGER).ignore()
            .hget(&job_key, "que")
            .query_async(&mut conn)
            .await?;
        let queue = que.ok_or(Error::JobNotFoundByUuid(job_uuid))?;

        let (removed_hash, removed_scheduled, removed_ready): (i64, i64, i64) = redis::pipe()
            .atomic()
            .del(&job_key)
            .zrem(self.keys.scheduled(&queue), job_uuid.to_string())
            .lrem(self.keys.ready(&queue), 0, job_uuid.to_string())
            .query_async(&mut conn)
            .await?;

        let _ = removed_hash;
        Ok(removed_scheduled > 0 || removed_ready > 0)
    }
}
