//! End-to-end tests against a real Redis. Gated behind the `test-redis`
//! feature (`cargo test --features test-redis`) since they need
//! `REDIS_URL` pointing at a live server and exercise `BLPOP`/`CLIENT
//! UNBLOCK`, which nothing in-process can fake convincingly.

#![cfg(feature = "test-redis")]

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use uuid::Uuid;

use onyx_background::config::{Config, WatcherConfig, WorkerConfig};
use onyx_background::job::{Job, JobError, JobRegistry};
use onyx_background::keys::Keys;
use onyx_background::manager::{EnqueueOptions, Manager};
use onyx_background::worker::{StopOptions, Worker};
use onyx_background::Watcher;

#[derive(Debug, ThisError)]
#[error("boom: {0}")]
struct ArgumentError(String);
impl JobError for ArgumentError {}

#[derive(Serialize, Deserialize, Default)]
struct SentinelJob {
    sentinel_key: String,
    value: String,
    #[serde(skip)]
    attempt_uuid: Uuid,
}

#[async_trait]
impl Job for SentinelJob {
    fn class_id() -> &'static str {
        "queue_test::SentinelJob"
    }

    fn set_attempt_uuid(&mut self, attempt_uuid: Uuid) {
        self.attempt_uuid = attempt_uuid;
    }

    async fn perform(&mut self) -> Result<(), Box<dyn JobError>> {
        let client = redis::Client::open(std::env::var("REDIS_URL").unwrap()).unwrap();
        let mut conn = client.get_async_connection().await.unwrap();
        let _: () = conn.set(&self.sentinel_key, &self.value).await.unwrap();
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct FailingJob {
    #[serde(skip)]
    attempt_uuid: Uuid,
}

#[async_trait]
impl Job for FailingJob {
    fn class_id() -> &'static str {
        "queue_test::FailingJob"
    }

    fn set_attempt_uuid(&mut self, attempt_uuid: Uuid) {
        self.attempt_uuid = attempt_uuid;
    }

    async fn perform(&mut self) -> Result<(), Box<dyn JobError>> {
        Err(Box::new(ArgumentError("bad input".into())))
    }
}

/// Sleeps well past any `fibers_timeout` this test suite uses, standing in
/// for a job whose fiber connection never gets the chance to write its own
/// terminal pipeline before the Worker is torn down.
#[derive(Serialize, Deserialize, Default)]
struct SlowJob {
    #[serde(skip)]
    attempt_uuid: Uuid,
}

#[async_trait]
impl Job for SlowJob {
    fn class_id() -> &'static str {
        "queue_test::SlowJob"
    }

    fn set_attempt_uuid(&mut self, attempt_uuid: Uuid) {
        self.attempt_uuid = attempt_uuid;
    }

    async fn perform(&mut self) -> Result<(), Box<dyn JobError>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

/// Runs `test` against a freshly namespaced Manager/Config pair, cleaning
/// up every key under that namespace afterward regardless of outcome.
async fn run_namespace_test<T, Fut>(test: T)
where
    T: FnOnce(Config, Manager) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    dotenv::dotenv().ok();
    JobRegistry::register::<SentinelJob>();
    JobRegistry::register::<FailingJob>();
    JobRegistry::register::<SlowJob>();

    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let namespace = format!("onyx-test-{}", Uuid::new_v4());
    let config = Config::with_namespace(redis_url, namespace.clone());
    let pool = config.build_pool().expect("building pool");
    let manager = Manager::new(pool.clone(), &config);

    std::panic::AssertUnwindSafe(test(config, manager))
        .catch_unwind()
        .await
        .ok();

    let mut conn = pool.get().await.expect("cleanup: acquiring connection");
    let pattern = format!("{}:*", namespace);
    let mut iter: redis::AsyncIter<String> = redis::cmd("SCAN")
        .cursor_arg(0)
        .arg("MATCH")
        .arg(&pattern)
        .arg("COUNT")
        .arg(100)
        .clone()
        .iter_async(&mut conn)
        .await
        .expect("cleanup: scanning keyspace");

    let mut del_cmd = redis::cmd("DEL");
    let mut any = false;
    while let Some(key) = iter.next_item().await {
        del_cmd.arg(key);
        any = true;
    }
    drop(iter);
    if any {
        let _: () = del_cmd.query_async(&mut conn).await.expect("cleanup: deleting keys");
    }
}

#[tokio::test]
async fn immediate_job_completes_and_sets_sentinel() {
    run_namespace_test(|config, manager| async move {
        let sentinel_key = format!("onyx-test-sentinel-{}", Uuid::new_v4());
        let arg = serde_json::to_string(&SentinelJob {
            sentinel_key: sentinel_key.clone(),
            value: "foo".into(),
            attempt_uuid: Uuid::nil(),
        })
        .unwrap();

        let job_uuid = manager
            .enqueue("queue_test::SentinelJob", &arg, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let worker = Worker::new(&config, WorkerConfig::default(), vec!["default".into()])
            .await
            .expect("constructing worker");
        let run_worker = worker.clone();
        let handle = tokio::spawn(async move { run_worker.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.stop(StopOptions::default()).await.expect("stop");
        handle.await.unwrap().expect("worker run");

        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let keys = Keys::new(config.namespace.clone());

        let value: Option<String> = conn.get(&sentinel_key).await.unwrap();
        assert_eq!(value.as_deref(), Some("foo"));

        let completed: i64 = conn.zcard(keys.completed("default")).await.unwrap();
        assert_eq!(completed, 1);
        let failed: i64 = conn.zcard(keys.failed("default")).await.unwrap();
        assert_eq!(failed, 0);
        let processing: i64 = conn.scard(keys.processing("default")).await.unwrap();
        assert_eq!(processing, 0);

        let _ = job_uuid;
        let _: () = conn.del(&sentinel_key).await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn failing_job_records_its_error_kind() {
    run_namespace_test(|config, manager| async move {
        let arg = serde_json::to_string(&FailingJob { attempt_uuid: Uuid::nil() }).unwrap();
        manager
            .enqueue("queue_test::FailingJob", &arg, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let worker = Worker::new(&config, WorkerConfig::default(), vec!["default".into()])
            .await
            .expect("constructing worker");
        let run_worker = worker.clone();
        let handle = tokio::spawn(async move { run_worker.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        worker.stop(StopOptions::default()).await.expect("stop");
        handle.await.unwrap().expect("worker run");

        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let keys = Keys::new(config.namespace.clone());

        let failed_ids: Vec<String> = conn
            .zrangebyscore(keys.failed("default"), 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(failed_ids.len(), 1);

        let attempt_uuid: Uuid = failed_ids[0].parse().unwrap();
        let err: Option<String> = conn.hget(keys.attempt(attempt_uuid), "err").await.unwrap();
        assert_eq!(err.as_deref(), Some("ArgumentError"));
    })
    .await;
}

#[tokio::test]
async fn dequeue_removes_a_scheduled_job_before_it_runs() {
    run_namespace_test(|config, manager| async move {
        let arg = serde_json::to_string(&SentinelJob::default()).unwrap();
        let job_uuid = manager
            .enqueue(
                "queue_test::SentinelJob",
                &arg,
                EnqueueOptions::default().in_duration(chrono::Duration::minutes(1)),
            )
            .await
            .expect("enqueue");

        let removed = manager.dequeue(job_uuid).await.expect("dequeue");
        assert!(removed);

        let err = manager.dequeue(job_uuid).await.expect_err("second dequeue should fail");
        assert_matches::assert_matches!(err, onyx_background::Error::JobNotFoundByUuid(id) if id == job_uuid);

        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let keys = Keys::new(config.namespace.clone());
        let scheduled: i64 = conn.zcard(keys.scheduled("default")).await.unwrap();
        assert_eq!(scheduled, 0);
    })
    .await;
}

#[tokio::test]
async fn watcher_promotes_a_due_scheduled_job() {
    run_namespace_test(|config, manager| async move {
        let sentinel_key = format!("onyx-test-sentinel-{}", Uuid::new_v4());
        let arg = serde_json::to_string(&SentinelJob {
            sentinel_key: sentinel_key.clone(),
            value: "scheduled".into(),
            attempt_uuid: Uuid::nil(),
        })
        .unwrap();

        manager
            .enqueue(
                "queue_test::SentinelJob",
                &arg,
                EnqueueOptions::default().in_duration(chrono::Duration::milliseconds(1)),
            )
            .await
            .expect("enqueue");

        let watcher_config = WatcherConfig {
            interval: Duration::from_millis(100),
        };
        let watcher = Watcher::new(&config, watcher_config, vec!["default".into()]).expect("watcher");
        let run_watcher = watcher.clone();
        tokio::spawn(async move { run_watcher.run().await });

        let worker = Worker::new(&config, WorkerConfig::default(), vec!["default".into()])
            .await
            .expect("constructing worker");
        let run_worker = worker.clone();
        tokio::spawn(async move { run_worker.run().await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        watcher.stop();
        worker.stop(StopOptions::default()).await.expect("stop");

        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let value: Option<String> = conn.get(&sentinel_key).await.unwrap();
        assert_eq!(value.as_deref(), Some("scheduled"));
        let _: () = conn.del(&sentinel_key).await.unwrap();
    })
    .await;
}

/// A `processing` member whose `wrk` names a client id absent from `CLIENT
/// LIST` must be reclaimed as a stale attempt: moved to `failed` with
/// `err = "Worker Timeout"` and no `fin`, and removed from `processing`.
#[tokio::test]
async fn stale_attempt_is_reclaimed_as_worker_timeout() {
    run_namespace_test(|config, _manager| async move {
        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let keys = Keys::new(config.namespace.clone());

        let attempt_uuid = Uuid::new_v4();
        let dead_client_id: i64 = 987_654_321;
        let sta = chrono::Utc::now().timestamp_millis();
        let _: () = redis::pipe()
            .atomic()
            .sadd(keys.processing("default"), attempt_uuid.to_string())
            .ignore()
            .hset_multiple(
                keys.attempt(attempt_uuid),
                &[
                    ("sta", sta.to_string()),
                    ("job", Uuid::new_v4().to_string()),
                    ("wrk", dead_client_id.to_string()),
                    ("que", "default".to_string()),
                ],
            )
            .ignore()
            .query_async(&mut conn)
            .await
            .unwrap();

        let watcher_config = WatcherConfig {
            interval: Duration::from_millis(50),
        };
        let watcher = Watcher::new(&config, watcher_config, vec!["default".into()]).expect("watcher");
        let run_watcher = watcher.clone();
        tokio::spawn(async move { run_watcher.run().await });

        tokio::time::sleep(Duration::from_millis(400)).await;
        watcher.stop();

        let processing: i64 = conn.scard(keys.processing("default")).await.unwrap();
        assert_eq!(processing, 0);

        let failed_ids: Vec<String> = conn
            .zrangebyscore(keys.failed("default"), 0, i64::MAX)
            .await
            .unwrap();
        assert!(failed_ids.contains(&attempt_uuid.to_string()));

        let err: Option<String> = conn.hget(keys.attempt(attempt_uuid), "err").await.unwrap();
        assert_eq!(err.as_deref(), Some("Worker Timeout"));

        let fin: Option<String> = conn.hget(keys.attempt(attempt_uuid), "fin").await.unwrap();
        assert!(fin.is_none());
    })
    .await;
}

/// `force_kill` tears fiber connections down immediately rather than waiting
/// out a long-running job, and `stop` returns without blocking on it.
#[tokio::test]
async fn force_kill_stops_without_waiting_for_in_flight_job() {
    run_namespace_test(|config, manager| async move {
        let arg = serde_json::to_string(&SlowJob::default()).unwrap();
        manager
            .enqueue("queue_test::SlowJob", &arg, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let worker = Worker::new(&config, WorkerConfig::default(), vec!["default".into()])
            .await
            .expect("constructing worker");
        let run_worker = worker.clone();
        let handle = tokio::spawn(async move { run_worker.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stop_started = tokio::time::Instant::now();
        worker
            .stop(StopOptions {
                force_kill: true,
                fibers_timeout: None,
            })
            .await
            .expect("stop");
        assert!(
            stop_started.elapsed() < Duration::from_secs(2),
            "force_kill must not wait for the 5s job to finish"
        );
        handle.await.unwrap().expect("worker run");

        let pool = config.build_pool().unwrap();
        let mut conn = pool.get().await.unwrap();
        let keys = Keys::new(config.namespace.clone());
        let processing: i64 = conn.scard(keys.processing("default")).await.unwrap();
        assert_eq!(
            processing, 1,
            "the killed fiber never got to write its terminal pipeline, so the job stays in processing for the watcher to reclaim"
        );
    })
    .await;
}

/// `fibers_timeout` waits out the timeout before force-killing, instead of
/// force-killing immediately or waiting for the job to finish on its own.
#[tokio::test]
async fn fibers_timeout_waits_then_force_kills() {
    run_namespace_test(|config, manager| async move {
        let arg = serde_json::to_string(&SlowJob::default()).unwrap();
        manager
            .enqueue("queue_test::SlowJob", &arg, EnqueueOptions::default())
            .await
            .expect("enqueue");

        let worker = Worker::new(&config, WorkerConfig::default(), vec!["default".into()])
            .await
            .expect("constructing worker");
        let run_worker = worker.clone();
        let handle = tokio::spawn(async move { run_worker.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stop_started = tokio::time::Instant::now();
        worker
            .stop(StopOptions {
                force_kill: false,
                fibers_timeout: Some(Duration::from_millis(500)),
            })
            .await
            .expect("stop");
        let elapsed = stop_started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "stop must wait out fibers_timeout first");
        assert!(elapsed < Duration::from_secs(2), "stop must not wait for the full 5s job to finish");
        handle.await.unwrap().expect("worker run");
    })
    .await;
}
