//! In-memory conversation threads with idle eviction
//!
//! A thread is acquired for exclusive use for the duration of one request.
//! Requests on the same thread id queue behind each other; requests on
//! different ids never contend beyond a short map lookup.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::state::AgentState;
use crate::metrics::{THREADS_ACTIVE, THREADS_EVICTED};

/// Configuration for the thread store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadStoreConfig {
    /// Threads untouched for longer than this are evicted
    pub idle_ttl_secs: u64,
    /// Period of the background sweep
    pub sweep_interval_secs: u64,
}

impl Default for ThreadStoreConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl ThreadStoreConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// One conversation's state plus its last-access time
#[derive(Debug)]
pub struct Thread {
    pub id: String,
    pub state: AgentState,
    last_access: Instant,
}

impl Thread {
    fn new(id: String) -> Self {
        Self {
            id,
            state: AgentState::new(),
            last_access: Instant::now(),
        }
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Mark the thread as used now
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// Exclusive handle to a thread, released on drop
pub struct ThreadGuard {
    guard: OwnedMutexGuard<Thread>,
}

impl Deref for ThreadGuard {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.guard
    }
}

impl DerefMut for ThreadGuard {
    fn deref_mut(&mut self) -> &mut Thread {
        &mut self.guard
    }
}

/// Process-wide map from thread id to thread
///
/// Constructed once at startup and shared by reference; there is no global
/// instance.
pub struct ThreadStore {
    threads: Mutex<HashMap<String, Arc<AsyncMutex<Thread>>>>,
    idle_ttl: Duration,
}

impl ThreadStore {
    pub fn new(config: &ThreadStoreConfig) -> Self {
        Self::with_ttl(config.idle_ttl())
    }

    pub fn with_ttl(idle_ttl: Duration) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    /// Get or create the thread and wait until it is free
    ///
    /// # Arguments
    /// * `thread_id` - Conversation identifier; created empty on first use
    ///
    /// # Returns
    /// A guard holding the thread exclusively until dropped
    pub async fn acquire(&self, thread_id: &str) -> ThreadGuard {
        let slot = {
            let mut threads = self.lock_map();
            threads
                .entry(thread_id.to_string())
                .or_insert_with(|| {
                    debug!(thread_id, "Creating thread");
                    THREADS_ACTIVE.inc();
                    Arc::new(AsyncMutex::new(Thread::new(thread_id.to_string())))
                })
                .clone()
        };
        ThreadGuard {
            guard: slot.lock_owned().await,
        }
    }

    /// Copy of a thread's state, waiting for any in-flight request to finish
    pub async fn snapshot(&self, thread_id: &str) -> Option<AgentState> {
        let slot = self.lock_map().get(thread_id).cloned()?;
        let thread = slot.lock().await;
        Some(thread.state.clone())
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.lock_map().contains_key(thread_id)
    }

    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    /// Remove a thread outright; returns whether it existed
    pub fn remove(&self, thread_id: &str) -> bool {
        let removed = self.lock_map().remove(thread_id).is_some();
        if removed {
            THREADS_ACTIVE.dec();
        }
        removed
    }

    /// Evict threads idle for longer than the TTL
    ///
    /// Threads currently held by a request, or waited on by one, are never
    /// evicted.
    ///
    /// # Returns
    /// Number of threads removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut threads = self.lock_map();
        let before = threads.len();

        threads.retain(|id, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(thread) => {
                    let idle = now.saturating_duration_since(thread.last_access);
                    if idle > self.idle_ttl {
                        debug!(thread_id = %id, idle_secs = idle.as_secs(), "Evicting idle thread");
                        false
                    } else {
                        true
                    }
                }
                Err(_) => true,
            }
        });

        let evicted = before - threads.len();
        if evicted > 0 {
            THREADS_EVICTED.inc_by(evicted as u64);
            THREADS_ACTIVE.sub(evicted as i64);
            info!(evicted, remaining = threads.len(), "Thread sweep completed");
        }
        evicted
    }

    /// Start the background sweep
    ///
    /// # Arguments
    /// * `interval` - Time between sweeps
    ///
    /// # Returns
    /// JoinHandle for the sweep task; abort it to stop sweeping
    pub fn start_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<Thread>>>> {
        // The map is only touched in short non-panicking sections
        self.threads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
