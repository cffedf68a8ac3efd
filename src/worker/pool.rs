//! The Worker's bounded fiber connection pool.
//!
//! Unlike the rest of this crate, which leans on `deadpool-redis` for pooled
//! connections, this pool is bespoke: each fiber needs a connection with its
//! own `CLIENT SETNAME`/`CLIENT ID` identity so the Watcher can tell it
//! apart in `CLIENT LIST`, and the pool needs to be forcibly torn down
//! (`CLIENT UNBLOCK`/`CLIENT KILL`) on a hard shutdown. `deadpool` hands
//! back anonymous, recycled connections and has no concept of killing one
//! from the outside, so it does not fit here. Bookkeeping is a
//! `std::sync::Mutex` over plain data, held only across synchronous
//! updates, never across an `.await`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::Connection;
use redis::Client;
use tracing::{event, Level};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::keys::client_names;

/// A connection checked out of the [`FiberPool`], tagged with the client id
/// the server assigned it.
pub struct FiberConn {
    pub conn: Connection,
    pub client_id: i64,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<FiberConn>,
    in_use: usize,
    known_ids: HashSet<i64>,
}

pub struct FiberPool {
    client: Client,
    worker_client_id: i64,
    config: WorkerConfig,
    state: Mutex<PoolState>,
}

impl FiberPool {
    pub fn new(client: Client, worker_client_id: i64, config: WorkerConfig) -> Self {
        FiberPool {
            client,
            worker_client_id,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                in_use: 0,
                known_ids: HashSet::new(),
            }),
        }
    }

    /// Live connections currently on loan to a fiber.
    pub fn in_use_count(&self) -> usize {
        self.state.lock().unwrap().in_use
    }

    pub fn fibers_check_interval(&self) -> Duration {
        self.config.fibers_check_interval
    }

    /// Acquire a connection, opening a fresh one (tagged with the
    /// `onyx-background-worker-fiber:<worker_client_id>` client name) if
    /// under the `fibers` cap, otherwise sleeping `redis_pool_wait` and
    /// retrying.
    pub async fn acquire(&self) -> Result<FiberConn> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(conn) = state.idle.pop() {
                    state.in_use += 1;
                    return Ok(conn);
                }
                if state.idle.len() + state.in_use < self.config.fibers {
                    state.in_use += 1;
                } else {
                    drop(state);
                    tokio::time::sleep(self.config.redis_pool_wait).await;
                    continue;
                }
            }

            match self.open_new().await {
                Ok(conn) => {
                    self.state.lock().unwrap().known_ids.insert(conn.client_id);
                    return Ok(conn);
                }
                Err(e) => {
                    // Give the slot back; the caller sees the error and the
                    // next `acquire` can try again.
                    self.state.lock().unwrap().in_use -= 1;
                    return Err(e);
                }
            }
        }
    }

    async fn open_new(&self) -> Result<FiberConn> {
        let mut conn = self.client.get_async_connection().await?;
        let name = client_names::fiber(self.worker_client_id);

        redis::pipe()
            .atomic()
            .cmd("CLIENT").arg("SETNAME").arg(&name).ignore()
            .cmd("CLIENT").arg("ID")
            .query_async(&mut conn)
            .await
            .map(|(client_id,): (i64,)| client_id)
            .map(|client_id| FiberConn {
                conn,
                client_id,
                last_used: Instant::now(),
            })
            .map_err(Into::into)
    }

    /// Returns a connection to the idle pool, stamping its last-used time.
    pub fn release(&self, mut conn: FiberConn) {
        conn.last_used = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.in_use -= 1;
        state.idle.push(conn);
    }

    /// Drops idle connections that have outlived `redis_pool_ttl`. Meant to
    /// be called roughly once a second from the Worker's reap task.
    pub fn reap_idle(&self) {
        let mut state = self.state.lock().unwrap();
        let ttl = self.config.redis_pool_ttl;
        let before = state.idle.len();
        state.idle.retain(|c| c.last_used.elapsed() < ttl);
        let reaped = before - state.idle.len();
        if reaped > 0 {
            event!(Level::DEBUG, count = reaped, "Reaped idle fiber connections");
        }
    }

    /// Forcibly tears down every known fiber connection via `CLIENT
    /// UNBLOCK`/`CLIENT KILL` issued over `control_conn`, then drops all
    /// idle connections locally. In-flight attempts holding a killed
    /// connection will see their next Redis call fail, which surfaces as a
    /// failed attempt through the ordinary error path.
    pub async fn clear(&self, control_conn: &mut Connection) {
        let ids: Vec<i64> = {
            let mut state = self.state.lock().unwrap();
            state.idle.clear();
            state.known_ids.drain().collect()
        };

        for id in ids {
            // TIMEOUT (not ERROR) mode: fiber connections are not normally
            // parked in a blocking call, this is a precautionary unblock
            // before the kill actually severs the connection.
            let unblock: std::result::Result<i64, _> = redis::cmd("CLIENT")
                .arg("UNBLOCK")
                .arg(id)
                .arg("TIMEOUT")
                .query_async(control_conn)
                .await;
            if let Err(e) = unblock {
                event!(Level::WARN, client_id = id, error = %e, "CLIENT UNBLOCK failed");
            }

            let kill: std::result::Result<(), _> = redis::cmd("CLIENT")
                .arg("KILL")
                .arg("ID")
                .arg(id)
                .query_async(control_conn)
                .await;
            if let Err(e) = kill {
                event!(Level::WARN, client_id = id, error = %e, "CLIENT KILL failed");
            }
        }
    }
}

pub fn default_reap_interval() -> Duration {
    Duration::from_secs(1)
}
