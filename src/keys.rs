//! Key layout for the `<ns>:<kind>:<queue-or-uuid>` convention.
//!
//! Precomputes one `String` per list/set instead of formatting on every
//! call, the same shape as `QueueInner`'s field-building in
//! `Queue::new` elsewhere in this family of services.

use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Keys {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn job(&self, job_uuid: Uuid) -> String {
        format!("{}:jobs:{}", self.namespace, job_uuid)
    }

    pub fn ready(&self, queue: &str) -> String {
        format!("{}:ready:{}", self.namespace, queue)
    }

    pub fn scheduled(&self, queue: &str) -> String {
        format!("{}:scheduled:{}", self.namespace, queue)
    }

    pub fn processing(&self, queue: &str) -> String {
        format!("{}:processing:{}", self.namespace, queue)
    }

    pub fn completed(&self, queue: &str) -> String {
        format!("{}:completed:{}", self.namespace, queue)
    }

    pub fn failed(&self, queue: &str) -> String {
        format!("{}:failed:{}", self.namespace, queue)
    }

    pub fn attempt(&self, attempt_uuid: Uuid) -> String {
        format!("{}:attempts:{}", self.namespace, attempt_uuid)
    }

    /// Regex-safe prefix used to recover a queue name from a `BLPOP` reply key.
    pub fn ready_prefix(&self) -> String {
        format!("{}:ready:", self.namespace)
    }
}

/// Client names the Watcher parses; the contract is bit-exact.
///
/// `CLIENT SETNAME` rejects names containing spaces, so these are exactly
/// the strings passed to it. The "trailing space" the protocol mentions is
/// a property of `CLIENT LIST`'s own `key=value ` field separator, which the
/// Watcher's parser already accounts for — it is not part of the name.
pub mod client_names {
    pub const MANAGER: &str = "onyx-background-manager";

    pub fn worker(queues_csv: &str) -> String {
        format!("onyx-background-worker:{}", queues_csv)
    }

    pub fn fiber(worker_client_id: i64) -> String {
        format!("onyx-background-worker-fiber:{}", worker_client_id)
    }

    pub const WATCHER: &str = "onyx-background-watcher";

    pub const FIBER_PREFIX: &str = "onyx-background-worker-fiber:";
    pub const WORKER_PREFIX: &str = "onyx-background-worker:";
}
