//! Time-bounded memoisation of per-guardian disability sets.
//!
//! The cache only saves record-store round trips during personalisation.
//! Concurrent refreshes of one key may race; the last write wins. Expired
//! entries are swept on write, at most once per TTL.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::NotificationResult;
use crate::recipients::ChildRecordRepository;
use crate::suppression::normalize_email;
use crate::vocabulary::DisabilityTag;

/// Default freshness window for cached entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::minutes(5);

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    disabilities: BTreeSet<DisabilityTag>,
    fetched_at: DateTime<Utc>,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_sweep: DateTime<Utc>,
}

pub struct RecipientCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RecipientCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_sweep = clock.now();
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_sweep,
            }),
            ttl,
            clock,
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(SystemClock))
    }

    /// Disabilities for a guardian, refreshed from `store` once the entry is older than the TTL.
    pub async fn disabilities_for(
        &self,
        email: &str,
        store: &dyn ChildRecordRepository,
    ) -> NotificationResult<BTreeSet<DisabilityTag>> {
        let key = normalize_email(email);
        let now = self.clock.now();

        if let Some(entry) = self.state.read().await.entries.get(&key) {
            if now - entry.fetched_at < self.ttl {
                return Ok(entry.disabilities.clone());
            }
        }

        debug!(guardian = %key, "Refreshing cached disabilities");
        let disabilities = store.disabilities_for_guardian(&key).await?;
        self.store_entry(key, disabilities.clone(), self.clock.now()).await;
        Ok(disabilities)
    }

    /// Seed an entry with data fetched elsewhere, e.g. by the recipient matcher.
    pub async fn prime(&self, email: &str, disabilities: BTreeSet<DisabilityTag>) {
        let now = self.clock.now();
        self.store_entry(normalize_email(email), disabilities, now).await;
    }

    pub async fn invalidate(&self, email: &str) {
        self.state.write().await.entries.remove(&normalize_email(email));
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        self.sweep(&mut state, now)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    async fn store_entry(
        &self,
        key: String,
        disabilities: BTreeSet<DisabilityTag>,
        fetched_at: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        if fetched_at - state.last_sweep >= self.ttl {
            self.sweep(&mut state, fetched_at);
        }
        state.entries.insert(
            key,
            CacheEntry {
                disabilities,
                fetched_at,
            },
        );
    }

    fn sweep(&self, state: &mut CacheState, now: DateTime<Utc>) -> usize {
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now - entry.fetched_at < self.ttl);
        state.last_sweep = now;

        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }
}
