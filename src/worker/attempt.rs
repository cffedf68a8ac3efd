//! The per-attempt procedure a fiber runs after popping a `job_uuid` off a
//! ready list.

use std::time::Instant;

use chrono::Utc;
use redis::AsyncCommands;
use tracing::{event, Level};
use uuid::Uuid;

use crate::error::Result;
use crate::job::JobRegistry;
use crate::keys::Keys;
use crate::worker::pool::FiberConn;

/// String written into an attempt's `err` field when the fiber's own `cls`
/// lookup comes back empty — distinct from the class-not-registered case,
/// which happens one step later during registry resolution.
const ERR_JOB_NOT_FOUND_BY_CLASS: &str = "JobNotFoundByClass";

pub async fn run_attempt(fiber: &mut FiberConn, keys: &Keys, queue: &str, job_uuid: Uuid) -> Result<()> {
    let attempt_uuid = Uuid::new_v4();
    let job_key = keys.job(job_uuid);

    let (cls, arg): (Option<String>, Option<String>) = fiber
        .conn
        .hget(&job_key, &["cls", "arg"])
        .await?;

    let (cls, arg) = match (cls, arg) {
        (Some(cls), Some(arg)) => (cls, arg),
        _ => {
            // Race with a concurrent Manager::dequeue; this job was already
            // removed. Nothing was ever recorded for it, so there is
            // nothing further to clean up.
            event!(Level::ERROR, job = %job_uuid, "Job hash missing at pop time, dropping");
            return Ok(());
        }
    };

    let attempt_key = keys.attempt(attempt_uuid);
    let sta = Utc::now();
    redis::pipe()
        .atomic()
        .sadd(keys.processing(queue), attempt_uuid.to_string())
        .ignore()
        .hset_multiple(
            &attempt_key,
            &[
                ("sta", sta.timestamp_millis().to_string()),
                ("job", job_uuid.to_string()),
                ("wrk", fiber.client_id.to_string()),
                ("que", queue.to_string()),
            ],
        )
        .ignore()
        .query_async(&mut fiber.conn)
        .await?;

    let start = Instant::now();
    let outcome = match JobRegistry::build(&cls, &arg, attempt_uuid) {
        Ok(mut job) => job.perform_erased().await,
        Err(_) => Err((ERR_JOB_NOT_FOUND_BY_CLASS.to_string(), format!("no job class registered for {}", cls))),
    };
    let tim = start.elapsed().as_secs_f64() * 1000.0;
    let fin = Utc::now();

    let mut pipe = redis::pipe();
    pipe.atomic();
    match outcome {
        Ok(()) => {
            event!(Level::INFO, job = %job_uuid, attempt = %attempt_uuid, queue = %queue, "Job completed");
            pipe.hset_multiple(
                &attempt_key,
                &[
                    ("fin", fin.timestamp_millis().to_string()),
                    ("tim", tim.to_string()),
                ],
            )
            .ignore();
            pipe.srem(keys.processing(queue), attempt_uuid.to_string()).ignore();
            pipe.zadd(keys.completed(queue), attempt_uuid.to_string(), fin.timestamp_millis())
                .ignore();
        }
        Err((kind, message)) => {
            event!(Level::ERROR, job = %job_uuid, attempt = %attempt_uuid, queue = %queue, kind = %kind, error = %message, "Job failed");
            pipe.hset_multiple(
                &attempt_key,
                &[
                    ("fin", fin.timestamp_millis().to_string()),
                    ("tim", tim.to_string()),
                    ("err", kind),
                ],
            )
            .ignore();
            pipe.srem(keys.processing(queue), attempt_uuid.to_string()).ignore();
            pipe.zadd(keys.failed(queue), attempt_uuid.to_string(), fin.timestamp_millis())
                .ignore();
        }
    }

    // A datastore error here leaves the attempt in `processing`; it will
    // eventually be reclaimed by the Watcher as a stale attempt.
    pipe.query_async(&mut fiber.conn).await?;

    Ok(())
}
