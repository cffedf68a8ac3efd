//! The job registry: a process-local map from class-id string to a factory
//! that can reconstitute a runnable job from its serialized arguments.
//!
//! An explicit `HashMap` guarded by a `Mutex`, in the same
//! `lazy_static!`-backed global-state style used elsewhere in this family
//! of services for precompiled Lua scripts.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::Error;

/// A unit of work an application registers and a Worker executes.
///
/// `perform` takes `&mut self` so implementations may stash the injected
/// attempt UUID and use it (e.g. for idempotency keys in side effects); it
/// returns no value on success because results are side effects, not a
/// return channel.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The class identifier this job is enqueued and dequeued under. Typically
    /// the application's fully qualified type name.
    fn class_id() -> &'static str
    where
        Self: Sized;

    /// Receives the freshly generated attempt UUID before `perform` runs.
    fn set_attempt_uuid(&mut self, attempt_uuid: Uuid);

    async fn perform(&mut self) -> Result<(), Box<dyn JobError>>;
}

/// A job error that knows its own "simple kind name" — the bare type name
/// (e.g. `"ArgumentError"`), as opposed to `Display`'s human-readable
/// message. The protocol records this in the attempt's `err` field rather
/// than a stack trace.
///
/// The default implementation derives the name from `std::any::type_name`,
/// which is resolved per-`impl` at compile time, so a plain `impl JobError
/// for MyError {}` is almost always enough.
pub trait JobError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> &'static str {
        type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("JobError")
    }
}

/// Object-safe wrapper so the registry can hand back a `Box<dyn ErasedJob>`
/// without committing to one concrete `Job` type.
#[async_trait]
pub trait ErasedJob: Send {
    async fn perform_erased(&mut self) -> Result<(), (String, String)>;
}

struct JobWrapper<T> {
    inner: T,
}

#[async_trait]
impl<T: Job> ErasedJob for JobWrapper<T> {
    async fn perform_erased(&mut self) -> Result<(), (String, String)> {
        self.inner
            .perform()
            .await
            .map_err(|e| (e.kind().to_string(), e.to_string()))
    }
}

type Factory = Box<dyn Fn(&str, Uuid) -> Result<Box<dyn ErasedJob>, Error> + Send + Sync>;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Factory>> = Mutex::new(HashMap::new());
}

/// The process-local dispatch table from class-id to constructor.
///
/// Registration must happen before a [`crate::worker::Worker`] starts
/// consuming; there is no way to register a class after the Worker's main
/// loop has begun popping jobs for it.
pub struct JobRegistry;

impl JobRegistry {
    /// Registers `T` under its own [`Job::class_id`]. `T` must also implement
    /// `Deserialize` so the registry can turn the stored `arg` string back
    /// into a live instance.
    pub fn register<T>()
    where
        T: Job + DeserializeOwned,
    {
        let class_id = T::class_id().to_string();
        let factory: Factory = Box::new(|arg, attempt_uuid| {
            let mut job: T = serde_json::from_str(arg)?;
            job.set_attempt_uuid(attempt_uuid);
            Ok(Box::new(JobWrapper { inner: job }) as Box<dyn ErasedJob>)
        });
        REGISTRY.lock().unwrap().insert(class_id, factory);
    }

    /// Looks up `class_id` and, if found, deserializes `arg` into a runnable
    /// instance carrying `attempt_uuid`.
    pub fn build(class_id: &str, arg: &str, attempt_uuid: Uuid) -> Result<Box<dyn ErasedJob>, Error> {
        let registry = REGISTRY.lock().unwrap();
        let factory = registry
            .get(class_id)
            .ok_or_else(|| Error::JobClassNotRegistered(class_id.to_string()))?;
        factory(arg, attempt_uuid)
    }

    #[cfg(test)]
    pub fn clear() {
        REGISTRY.lock().unwrap().clear();
    }
}
