//! At-least-once work queue with leases.
//!
//! A dequeued item is leased to one worker for the lock duration. The worker
//! renews the lease while it is busy and completes it when done. Leases that
//! expire are picked up by [`WorkQueue::recover_stalled`]: the item is made
//! visible again until it has stalled more than `max_stalled_count` times,
//! after which it is dropped and reported as failed.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Work item payload. The job id doubles as the item id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub job_id: Uuid,
    pub upload_asset_id: String,
    pub source_file_ref: String,
    pub user_id: Option<String>,
}

/// A task reserved for one worker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task: ExtractionTask,
    pub token: String,
    /// How many times this item has stalled before this delivery
    pub stalled_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lock_duration: Duration,
    pub max_stalled_count: u32,
}

/// Outcome of one stalled-item sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StalledSweep {
    pub redelivered: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, task: &ExtractionTask) -> Result<(), QueueError>;

    /// Reserve the next visible item, if any.
    async fn dequeue(&self) -> Result<Option<Lease>, QueueError>;

    /// Extend the lease. `false` means the lease was lost to stall recovery.
    async fn renew(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Remove the item for good. `false` means the lease had already been lost.
    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError>;

    async fn recover_stalled(&self) -> Result<StalledSweep, QueueError>;

    /// Items waiting to be dequeued.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

const DEQUEUE_SCRIPT: &str = r#"
while true do
  local id = redis.call('RPOP', KEYS[1])
  if not id then return nil end
  local payload = redis.call('HGET', KEYS[4], id)
  if payload then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
    redis.call('HSET', KEYS[3], id, ARGV[2])
    local stalled = redis.call('HGET', KEYS[5], id) or '0'
    return {id, payload, stalled}
  end
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZADD', KEYS[1], 'XX', ARGV[3], ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

const RECOVER_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
local redelivered = {}
local failed = {}
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  local count = redis.call('HINCRBY', KEYS[5], id, 1)
  if count > tonumber(ARGV[2]) then
    redis.call('HDEL', KEYS[4], id)
    redis.call('HDEL', KEYS[5], id)
    table.insert(failed, id)
  else
    redis.call('RPUSH', KEYS[1], id)
    table.insert(redelivered, id)
  end
end
return {redelivered, failed}
"#;

struct QueueKeys {
    waiting: String,
    leases: String,
    tokens: String,
    items: String,
    stalled: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            waiting: format!("{name}:waiting"),
            leases: format!("{name}:leases"),
            tokens: format!("{name}:tokens"),
            items: format!("{name}:items"),
            stalled: format!("{name}:stalled"),
        }
    }
}

fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_id(raw: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(raw).map_err(|_| QueueError::Corrupt(format!("invalid item id {raw:?}")))
}

/// Redis-backed work queue.
pub struct RedisWorkQueue {
    client: redis::Client,
    keys: QueueKeys,
    config: LeaseConfig,
    dequeue: redis::Script,
    renew: redis::Script,
    complete: redis::Script,
    recover: redis::Script,
}

impl RedisWorkQueue {
    pub fn new(redis_url: &str, name: &str, config: LeaseConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            keys: QueueKeys::new(name),
            config,
            dequeue: redis::Script::new(DEQUEUE_SCRIPT),
            renew: redis::Script::new(RENEW_SCRIPT),
            complete: redis::Script::new(COMPLETE_SCRIPT),
            recover: redis::Script::new(RECOVER_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn lease_deadline(&self) -> i64 {
        epoch_millis() + self.config.lock_duration.as_millis() as i64
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, task: &ExtractionTask) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task)?;
        let id = task.job_id.to_string();
        redis::pipe()
            .atomic()
            .hset(&self.keys.items, &id, &payload)
            .ignore()
            .lpush(&self.keys.waiting, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Lease>, QueueError> {
        let mut conn = self.connection().await?;
        let token = Uuid::new_v4().to_string();
        let reserved: Option<(String, String, u32)> = self
            .dequeue
            .key(&self.keys.waiting)
            .key(&self.keys.leases)
            .key(&self.keys.tokens)
            .key(&self.keys.items)
            .key(&self.keys.stalled)
            .arg(self.lease_deadline())
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;

        match reserved {
            Some((_, payload, stalled_count)) => Ok(Some(Lease {
                task: serde_json::from_str(&payload)?,
                token,
                stalled_count,
            })),
            None => Ok(None),
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let renewed: i32 = self
            .renew
            .key(&self.keys.leases)
            .key(&self.keys.tokens)
            .arg(lease.task.job_id.to_string())
            .arg(&lease.token)
            .arg(self.lease_deadline())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let completed: i32 = self
            .complete
            .key(&self.keys.leases)
            .key(&self.keys.tokens)
            .key(&self.keys.items)
            .key(&self.keys.stalled)
            .arg(lease.task.job_id.to_string())
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(completed == 1)
    }

    async fn recover_stalled(&self) -> Result<StalledSweep, QueueError> {
        let mut conn = self.connection().await?;
        let (redelivered, failed): (Vec<String>, Vec<String>) = self
            .recover
            .key(&self.keys.waiting)
            .key(&self.keys.leases)
            .key(&self.keys.tokens)
            .key(&self.keys.items)
            .key(&self.keys.stalled)
            .arg(epoch_millis())
            .arg(self.config.max_stalled_count)
            .invoke_async(&mut conn)
            .await?;

        Ok(StalledSweep {
            redelivered: redelivered.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?,
            failed: failed.iter().map(|id| parse_id(id)).collect::<Result<_, _>>()?,
        })
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.keys.waiting).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    waiting: VecDeque<Uuid>,
    items: HashMap<Uuid, ExtractionTask>,
    leases: HashMap<Uuid, (Instant, String)>,
    stalled: HashMap<Uuid, u32>,
}

/// In-process queue with the same lease semantics as [`RedisWorkQueue`],
/// for tests and single-process runs.
pub struct MemoryWorkQueue {
    config: LeaseConfig,
    state: Mutex<MemoryQueueState>,
}

impl MemoryWorkQueue {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    /// Items currently leased to a worker.
    pub fn in_flight(&self) -> usize {
        self.state.lock().leases.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, task: &ExtractionTask) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.items.insert(task.job_id, task.clone());
        state.waiting.push_back(task.job_id);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state.lock();
        while let Some(id) = state.waiting.pop_front() {
            let Some(task) = state.items.get(&id).cloned() else {
                continue;
            };
            let token = Uuid::new_v4().to_string();
            let deadline = Instant::now() + self.config.lock_duration;
            state.leases.insert(id, (deadline, token.clone()));
            let stalled_count = state.stalled.get(&id).copied().unwrap_or(0);
            return Ok(Some(Lease {
                task,
                token,
                stalled_count,
            }));
        }
        Ok(None)
    }

    async fn renew(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease.task.job_id) {
            Some((deadline, token)) if *token == lease.token => {
                *deadline = Instant::now() + self.config.lock_duration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        let id = lease.task.job_id;
        match state.leases.get(&id) {
            Some((_, token)) if *token == lease.token => {
                state.leases.remove(&id);
                state.items.remove(&id);
                state.stalled.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self) -> Result<StalledSweep, QueueError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut expired: Vec<(Instant, Uuid)> = state
            .leases
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, (deadline, _))| (*deadline, *id))
            .collect();
        expired.sort();

        let mut sweep = StalledSweep::default();
        for (_, id) in expired {
            state.leases.remove(&id);
            let count = {
                let count = state.stalled.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            if count > self.config.max_stalled_count {
                state.items.remove(&id);
                state.stalled.remove(&id);
                sweep.failed.push(id);
            } else {
                state.waiting.push_front(id);
                sweep.redelivered.push(id);
            }
        }
        Ok(sweep)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().waiting.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),
}
