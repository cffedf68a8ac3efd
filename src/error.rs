use thiserror::Error;

/// All failure modes the crate can surface, grouped the way the protocol
/// description groups them: not-found, class resolution, execution, timeout,
/// datastore, and caller misuse.
#[derive(Debug, Error)]
pub enum Error {
    /// Manager dequeue of a job whose hash is missing, or a Worker that lost
    /// the race between popping a `job_uuid` and loading its hash.
    #[error("job not found by uuid: {0}")]
    JobNotFoundByUuid(uuid::Uuid),

    /// A Worker popped a job whose `cls` field has no matching registry entry.
    #[error("job class not registered: {0}")]
    JobClassNotRegistered(String),

    /// Calling `run` on a stopped Worker, `stop` twice, or `stop` on a Worker
    /// that was never started.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    #[error("redis error")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("failed to serialize job arguments")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
