//! Cooperative file locking with TTL expiry.
//!
//! Locks are advisory: tools are expected to check before writing, but the
//! registry cannot stop an implementation that skips the check. A write lock
//! on a (project, path) excludes every other lock on that path; read locks
//! coexist with each other. Every lock carries an expiry so a crashed holder
//! never wedges a path: expired locks are purged lazily on the next check or
//! acquire, and a background sweeper bounds staleness for untouched paths.
//!
//! Re-acquiring with the same holder and kind refreshes the expiry. A request
//! by the holder for a *different* kind on the same path is a conflict like
//! any other; there is no automatic read-to-write upgrade.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::agents::AgentId;
use crate::events::{AgentEvent, EventBroadcaster, NullBroadcaster};

/// Kind of file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
        }
    }
}

/// An active lock on a (project, path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub project_id: Uuid,
    pub path: String,
    pub holder: AgentId,
    pub kind: LockKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Errors from lock operations.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("Path is locked ({kind}) by agent {holder}")]
    Conflict { holder: AgentId, kind: LockKind },

    #[error("Lock not held by requesting agent")]
    NotHeld,
}

type LockMap = HashMap<(Uuid, String), Vec<FileLock>>;

/// In-process registry of advisory file locks.
pub struct LockRegistry {
    locks: Arc<RwLock<LockMap>>,
    events: Arc<dyn EventBroadcaster>,
    default_ttl_ms: u64,
}

impl LockRegistry {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(NullBroadcaster),
            default_ttl_ms,
        }
    }

    /// Attach an event broadcaster for lock grant/release notifications.
    pub fn with_events(mut self, events: Arc<dyn EventBroadcaster>) -> Self {
        self.events = events;
        self
    }

    /// Acquire a lock on (project, path) for `holder`.
    ///
    /// Same holder + same kind refreshes the existing lock. Any other live
    /// lock involving a write conflicts, including the holder's own lock of
    /// the other kind.
    pub async fn acquire(
        &self,
        project_id: Uuid,
        path: &str,
        holder: AgentId,
        kind: LockKind,
        ttl_ms: Option<u64>,
    ) -> Result<FileLock, LockError> {
        let now = Utc::now();
        let ttl = Duration::milliseconds(ttl_ms.unwrap_or(self.default_ttl_ms) as i64);
        let key = (project_id, path.to_string());

        let mut locks = self.locks.write().await;
        let entry = locks.entry(key).or_default();
        entry.retain(|l| !l.is_expired(now));

        // Idempotent refresh for a repeat acquire by the same holder.
        if let Some(existing) = entry
            .iter_mut()
            .find(|l| l.holder == holder && l.kind == kind)
        {
            existing.expires_at = now + ttl;
            return Ok(existing.clone());
        }

        if let Some(conflicting) = entry
            .iter()
            .find(|l| l.kind == LockKind::Write || kind == LockKind::Write)
        {
            return Err(LockError::Conflict {
                holder: conflicting.holder,
                kind: conflicting.kind,
            });
        }

        let lock = FileLock {
            project_id,
            path: path.to_string(),
            holder,
            kind,
            acquired_at: now,
            expires_at: now + ttl,
        };
        entry.push(lock.clone());
        drop(locks);

        self.events.publish(
            project_id,
            AgentEvent::LockAcquired {
                path: path.to_string(),
                holder,
                kind: kind.to_string(),
            },
        );
        Ok(lock)
    }

    /// Release `holder`'s lock on (project, path).
    ///
    /// Releasing a lock you don't hold is a safe no-op.
    pub async fn release(&self, project_id: Uuid, path: &str, holder: AgentId) {
        let key = (project_id, path.to_string());
        let mut locks = self.locks.write().await;
        let mut released = false;
        if let Some(entry) = locks.get_mut(&key) {
            let before = entry.len();
            entry.retain(|l| l.holder != holder);
            released = entry.len() != before;
            if entry.is_empty() {
                locks.remove(&key);
            }
        }
        drop(locks);

        if released {
            self.events.publish(
                project_id,
                AgentEvent::LockReleased {
                    path: path.to_string(),
                    holder,
                },
            );
        }
    }

    /// Release every lock held by `holder` across all projects.
    pub async fn release_all_for_holder(&self, holder: AgentId) {
        let mut locks = self.locks.write().await;
        let mut released: Vec<(Uuid, String)> = Vec::new();
        locks.retain(|key, entry| {
            let before = entry.len();
            entry.retain(|l| l.holder != holder);
            if entry.len() != before {
                released.push(key.clone());
            }
            !entry.is_empty()
        });
        drop(locks);

        for (project_id, path) in released {
            self.events
                .publish(project_id, AgentEvent::LockReleased { path, holder });
        }
    }

    /// Release every lock in a project (project teardown).
    pub async fn release_all_for_project(&self, project_id: Uuid) {
        let mut locks = self.locks.write().await;
        let mut released: Vec<(String, AgentId)> = Vec::new();
        locks.retain(|(project, path), entry| {
            if *project == project_id {
                for lock in entry.iter() {
                    released.push((path.clone(), lock.holder));
                }
                return false;
            }
            true
        });
        drop(locks);

        for (path, holder) in released {
            self.events
                .publish(project_id, AgentEvent::LockReleased { path, holder });
        }
    }

    /// Return the most restrictive active lock on (project, path), if any.
    ///
    /// An expired lock is purged as a side effect and reported as absent.
    pub async fn check(&self, project_id: Uuid, path: &str) -> Option<FileLock> {
        let now = Utc::now();
        let key = (project_id, path.to_string());
        let mut locks = self.locks.write().await;
        let entry = locks.get_mut(&key)?;
        entry.retain(|l| !l.is_expired(now));
        if entry.is_empty() {
            locks.remove(&key);
            return None;
        }
        entry
            .iter()
            .find(|l| l.kind == LockKind::Write)
            .or_else(|| entry.first())
            .cloned()
    }

    /// Push the expiry of `holder`'s lock forward by `extra_ms`.
    pub async fn extend(
        &self,
        project_id: Uuid,
        path: &str,
        holder: AgentId,
        extra_ms: u64,
    ) -> Result<FileLock, LockError> {
        let now = Utc::now();
        let key = (project_id, path.to_string());
        let mut locks = self.locks.write().await;
        let entry = locks.get_mut(&key).ok_or(LockError::NotHeld)?;
        entry.retain(|l| !l.is_expired(now));
        let lock = entry
            .iter_mut()
            .find(|l| l.holder == holder)
            .ok_or(LockError::NotHeld)?;
        lock.expires_at += Duration::milliseconds(extra_ms as i64);
        Ok(lock.clone())
    }

    /// Snapshot of all active locks in a project.
    pub async fn active_locks(&self, project_id: Uuid) -> Vec<FileLock> {
        let now = Utc::now();
        self.locks
            .read()
            .await
            .iter()
            .filter(|((project, _), _)| *project == project_id)
            .flat_map(|(_, entry)| entry.iter())
            .filter(|l| !l.is_expired(now))
            .cloned()
            .collect()
    }

    /// Delete all expired locks regardless of whether anyone queries them.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut locks = self.locks.write().await;
        let mut purged = 0;
        locks.retain(|_, entry| {
            let before = entry.len();
            entry.retain(|l| !l.is_expired(now));
            purged += before - entry.len();
            !entry.is_empty()
        });
        purged
    }

    /// Spawn the periodic expiry sweep. Abort the handle at shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = registry.sweep_expired().await;
                if purged > 0 {
                    tracing::debug!("Lock sweep purged {} expired locks", purged);
                }
            }
        })
    }
}
