// src/runtime/agent_pool.rs
//! Handler instance pool
//!
//! Building a handler (backend clients, warm-up) is expensive, so instances
//! are kept per handler type and shared by every request whose pool key
//! matches.
//!
//! # Architecture
//!
//! ```text
//! AgentPool
//! ├─ completion    → TypePool { LRU<PoolKey, PoolEntry>, key locks, hit/miss }
//! ├─ url_retrieval → TypePool { ... }
//! └─ Sweeper       (periodic health check + expiry)
//! ```
//!
//! An entry is valid while its instance is healthy and it was accessed
//! within `max_age`. Lookups of invalid entries miss and replace them. When
//! a pool is full the least recently accessed entry is evicted. Evicted
//! instances are cleaned up on a background task so the caller never waits.
//!
//! Creation for one key is serialized by a per-key async lock, so
//! concurrent misses for the same key build exactly one instance.

use crate::observability::telemetry::TelemetryRecorder;
use crate::runtime::agent_runtime::{AgentRuntime, AgentRuntimeConfig};
use crate::runtime::handler::HandlerFactory;
use crate::runtime::types::{HandlerConfig, HandlerType};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static GLOBAL_POOL: OnceCell<Arc<AgentPool>> = OnceCell::new();

/// Which configuration fields make two handlers interchangeable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKeyScope {
    /// `type|model_id|environment`: configs that differ only in tools,
    /// temperature, token limit, instructions or parameters share an instance
    #[default]
    Coarse,

    /// Every configuration field takes part in the key
    Exact,
}

/// Configuration for the instance pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPoolConfig {
    /// Maximum instances per handler type (default: 10)
    pub max_size: usize,

    /// Idle time after which an entry is invalid (default: 30 minutes)
    pub max_age_secs: u64,

    /// Interval between background sweeps (default: 5 minutes)
    pub sweep_interval_secs: u64,

    /// Pool key granularity
    pub key_scope: PoolKeyScope,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_age_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            key_scope: PoolKeyScope::Coarse,
        }
    }
}

impl AgentPoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Identity under which handler instances are shared
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn for_config(config: &HandlerConfig, scope: PoolKeyScope) -> Self {
        let coarse = format!(
            "{}|{}|{}",
            config.handler_type, config.model_id, config.environment
        );

        match scope {
            PoolKeyScope::Coarse => PoolKey(coarse),
            PoolKeyScope::Exact => {
                // BTreeMap gives a stable parameter order
                let parameters: BTreeMap<_, _> = config.parameters.iter().collect();
                let parameters = serde_json::to_string(&parameters).unwrap_or_default();

                PoolKey(format!(
                    "{}|{}|{}|{}|{:?}|{:?}|{}|{}",
                    coarse,
                    config.id,
                    config.name,
                    config.tools.join(","),
                    config.temperature,
                    config.max_tokens,
                    config.instructions,
                    parameters
                ))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pooled handler instance with its access bookkeeping
pub struct PoolEntry {
    pub instance: Arc<AgentRuntime>,
    pub last_accessed: Instant,
    pub access_count: u64,
}

impl PoolEntry {
    fn new(instance: Arc<AgentRuntime>) -> Self {
        Self {
            instance,
            last_accessed: Instant::now(),
            access_count: 0,
        }
    }

    fn is_valid(&self, now: Instant, max_age: Duration) -> bool {
        self.instance.is_healthy() && now.saturating_duration_since(self.last_accessed) < max_age
    }
}

/// Snapshot of one handler type's pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub handler_type: HandlerType,
    pub total_instances: usize,
    /// Instances currently executing at least one call
    pub active_instances: usize,
    pub idle_instances: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Instances of one handler type
struct TypePool {
    handler_type: HandlerType,
    entries: Mutex<LruCache<PoolKey, PoolEntry>>,
    key_locks: DashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    last_updated: Mutex<DateTime<Utc>>,
}

impl TypePool {
    fn new(handler_type: HandlerType) -> Self {
        Self {
            handler_type,
            entries: Mutex::new(LruCache::unbounded()),
            key_locks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            last_updated: Mutex::new(Utc::now()),
        }
    }

    /// Return a valid instance for `key`, bumping its recency
    fn lookup(&self, key: &PoolKey, max_age: Duration) -> Option<Arc<AgentRuntime>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        *self.last_updated.lock() = Utc::now();

        match entries.get_mut(key) {
            Some(entry) if entry.is_valid(now, max_age) => {
                entry.last_accessed = now;
                entry.access_count += 1;
                Some(Arc::clone(&entry.instance))
            }
            _ => None,
        }
    }

    /// Insert a fresh instance, returning whatever had to make room for it
    fn insert(&self, key: PoolKey, instance: Arc<AgentRuntime>, max_size: usize) -> Vec<PoolEntry> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();

        // An invalid entry for the same key is being replaced
        if let Some(stale) = entries.pop(&key) {
            removed.push(stale);
        }

        while entries.len() >= max_size.max(1) {
            match entries.pop_lru() {
                Some((evicted_key, entry)) => {
                    debug!("Evicting least recently used {} handler {}", self.handler_type, evicted_key);
                    removed.push(entry);
                }
                None => break,
            }
        }

        entries.put(key, PoolEntry::new(instance));
        *self.last_updated.lock() = Utc::now();

        metrics::gauge!("dispatch_pool_size", "type" => self.handler_type.as_str())
            .set(entries.len() as f64);

        removed
    }

    fn key_lock(&self, key: &PoolKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .key_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn drain(&self) -> Vec<PoolEntry> {
        let mut entries = self.entries.lock();
        let mut drained = Vec::with_capacity(entries.len());
        while let Some((_, entry)) = entries.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    fn stats(&self) -> PoolStats {
        let (total, active) = {
            let entries = self.entries.lock();
            let active = entries
                .iter()
                .filter(|(_, entry)| entry.instance.in_flight() > 0)
                .count();
            (entries.len(), active)
        };

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (hits as f64 / lookups as f64, misses as f64 / lookups as f64)
        };

        PoolStats {
            handler_type: self.handler_type,
            total_instances: total,
            active_instances: active,
            idle_instances: total - active,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            miss_rate,
            last_updated: *self.last_updated.lock(),
        }
    }
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-type pools of reusable handler instances
pub struct AgentPool {
    config: AgentPoolConfig,
    runtime_config: AgentRuntimeConfig,
    telemetry: Option<Arc<TelemetryRecorder>>,
    pools: DashMap<HandlerType, Arc<TypePool>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl AgentPool {
    /// Create an empty pool
    pub fn new(config: AgentPoolConfig) -> Self {
        info!(
            "Initializing agent pool (max {} per type, max age {}s)",
            config.max_size, config.max_age_secs
        );

        Self {
            config,
            runtime_config: AgentRuntimeConfig::default(),
            telemetry: None,
            pools: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Execution settings applied to every instance this pool creates
    pub fn with_runtime_config(mut self, runtime_config: AgentRuntimeConfig) -> Self {
        self.runtime_config = runtime_config;
        self
    }

    /// Telemetry recorder attached to every instance this pool creates
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryRecorder>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Install the process-wide pool. Fails if one is already installed.
    pub fn init_global(pool: Arc<AgentPool>) -> Result<()> {
        GLOBAL_POOL
            .set(pool)
            .map_err(|_| EngineError::PoolError("Global pool already initialized".to_string()))
    }

    /// Process-wide pool, created with defaults on first use
    pub fn global() -> Arc<AgentPool> {
        Arc::clone(GLOBAL_POOL.get_or_init(|| Arc::new(AgentPool::new(AgentPoolConfig::default()))))
    }

    pub fn config(&self) -> &AgentPoolConfig {
        &self.config
    }

    pub fn key_for(&self, config: &HandlerConfig) -> PoolKey {
        PoolKey::for_config(config, self.config.key_scope)
    }

    fn type_pool(&self, handler_type: HandlerType) -> Arc<TypePool> {
        Arc::clone(
            &self
                .pools
                .entry(handler_type)
                .or_insert_with(|| Arc::new(TypePool::new(handler_type))),
        )
    }

    /// Return a pooled instance for `config`, creating one on a miss
    pub async fn get_or_create(
        &self,
        config: HandlerConfig,
        factory: &dyn HandlerFactory,
    ) -> Result<Arc<AgentRuntime>> {
        let handler_type = config.handler_type;
        let key = self.key_for(&config);
        let pool = self.type_pool(handler_type);
        let max_age = self.config.max_age();

        if let Some(instance) = pool.lookup(&key, max_age) {
            self.record_hit(&pool);
            return Ok(instance);
        }

        let lock = pool.key_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have created it while we waited
        if let Some(instance) = pool.lookup(&key, max_age) {
            self.record_hit(&pool);
            return Ok(instance);
        }

        pool.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dispatch_pool_misses_total", "type" => handler_type.as_str())
            .increment(1);
        debug!("Pool miss for {}, creating handler", key);

        let instance = self.create_instance(config, factory).await?;
        let removed = pool.insert(key, Arc::clone(&instance), self.config.max_size);
        self.retire(&pool, removed);

        Ok(instance)
    }

    async fn create_instance(
        &self,
        config: HandlerConfig,
        factory: &dyn HandlerFactory,
    ) -> Result<Arc<AgentRuntime>> {
        let handler = factory.create(&config)?;

        let mut runtime = AgentRuntime::new(config, handler)?
            .with_runtime_config(self.runtime_config.clone());
        if let Some(telemetry) = &self.telemetry {
            runtime = runtime.with_telemetry(Arc::clone(telemetry));
        }

        runtime.initialize().await?;
        Ok(Arc::new(runtime))
    }

    fn record_hit(&self, pool: &TypePool) {
        pool.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dispatch_pool_hits_total", "type" => pool.handler_type.as_str())
            .increment(1);
    }

    /// Schedule cleanup of removed entries without blocking the caller
    fn retire(&self, pool: &TypePool, removed: Vec<PoolEntry>) {
        if removed.is_empty() {
            return;
        }

        pool.evictions
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        metrics::counter!("dispatch_pool_evictions_total", "type" => pool.handler_type.as_str())
            .increment(removed.len() as u64);

        for entry in removed {
            let instance = entry.instance;
            tokio::spawn(async move {
                if let Err(e) = instance.cleanup().await {
                    warn!("Failed to clean up evicted handler: {}", e);
                }
            });
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn evict(&self, handler_type: HandlerType, key: &PoolKey) -> bool {
        let Some(pool) = self.pools.get(&handler_type).map(|p| Arc::clone(p.value())) else {
            return false;
        };

        let removed = pool.entries.lock().pop(key);
        match removed {
            Some(entry) => {
                info!("Evicting {} handler {}", handler_type, key);
                self.retire(&pool, vec![entry]);
                true
            }
            None => false,
        }
    }

    /// Health-check idle instances and remove every invalid entry
    ///
    /// Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let max_age = self.config.max_age();
        let pools: Vec<Arc<TypePool>> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        let mut removed_total = 0;

        for pool in pools {
            let idle: Vec<Arc<AgentRuntime>> = pool
                .entries
                .lock()
                .iter()
                .filter(|(_, entry)| entry.instance.in_flight() == 0)
                .map(|(_, entry)| Arc::clone(&entry.instance))
                .collect();

            for instance in idle {
                instance.check_health().await;
            }

            let now = Instant::now();
            let removed: Vec<PoolEntry> = {
                let mut entries = pool.entries.lock();
                let stale: Vec<PoolKey> = entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_valid(now, max_age))
                    .map(|(key, _)| key.clone())
                    .collect();
                stale.iter().filter_map(|key| entries.pop(key)).collect()
            };

            let live: HashSet<PoolKey> = pool.entries.lock().iter().map(|(k, _)| k.clone()).collect();
            pool.key_locks
                .retain(|key, lock| live.contains(key) || Arc::strong_count(lock) > 1);

            if !removed.is_empty() {
                debug!("Sweep removed {} {} handlers", removed.len(), pool.handler_type);
                removed_total += removed.len();
                self.retire(&pool, removed);
            }
        }

        removed_total
    }

    /// Start the periodic sweep. Calling it while running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let interval = self.config.sweep_interval();
        info!("Starting pool sweeper every {:?}", interval);

        let token = CancellationToken::new();
        let stop = token.clone();
        let pool = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(pool) = pool.upgrade() else { break };
                let removed = pool.sweep().await;
                if removed > 0 {
                    info!("Pool sweep removed {} stale handlers", removed);
                }
            }

            debug!("Pool sweeper stopped");
        });

        *sweeper = Some(Sweeper { token, handle });
    }

    /// Stop the periodic sweep. Calling it while stopped is a no-op.
    pub fn stop_sweeper(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            info!("Stopping pool sweeper");
            sweeper.token.cancel();
            drop(sweeper.handle);
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    pub fn stats(&self, handler_type: HandlerType) -> Option<PoolStats> {
        self.pools.get(&handler_type).map(|pool| pool.stats())
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|pool| pool.stats()).collect();
        stats.sort_by_key(|s| s.handler_type);
        stats
    }

    /// Number of pooled instances across all types
    pub fn len(&self) -> usize {
        self.pools.iter().map(|pool| pool.entries.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every instance and wait for all cleanups
    ///
    /// Returns the number of instances removed.
    pub async fn clear_all(&self) -> usize {
        let pools: Vec<Arc<TypePool>> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        let mut cleanups = Vec::new();

        for pool in &pools {
            for entry in pool.drain() {
                cleanups.push(async move {
                    if let Err(e) = entry.instance.cleanup().await {
                        warn!("Failed to clean up handler during teardown: {}", e);
                    }
                });
            }
            pool.key_locks.clear();
        }

        let count = cleanups.len();
        futures::future::join_all(cleanups).await;
        info!("Cleared {} pooled handlers", count);
        count
    }

    /// Stop sweeping and tear down every instance
    pub async fn shutdown(&self) -> usize {
        self.stop_sweeper();
        self.clear_all().await
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::{
        mock_factory, slow_init_factory, test_config, Behavior, Counters,
    };
    use proptest::prelude::*;

    fn pool_with(max_size: usize) -> AgentPool {
        AgentPool::new(AgentPoolConfig {
            max_size,
            ..Default::default()
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reuse_same_key() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let a = pool
            .get_or_create(test_config(HandlerType::Completion, "m1"), &factory)
            .await
            .unwrap();
        let b = pool
            .get_or_create(test_config(HandlerType::Completion, "m1"), &factory)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counters.created(), 1);

        let stats = pool.stats(HandlerType::Completion).unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_instances, 1);
    }

    #[tokio::test]
    async fn test_coarse_key_shares_across_tuning() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let a = pool
            .get_or_create(
                test_config(HandlerType::Completion, "m1").with_temperature(0.1),
                &factory,
            )
            .await
            .unwrap();
        let b = pool
            .get_or_create(
                test_config(HandlerType::Completion, "m1").with_temperature(0.9),
                &factory,
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        // The first config wins for shared instances
        assert_eq!(b.config().temperature, Some(0.1));
    }

    #[tokio::test]
    async fn test_exact_key_separates_tuning() {
        let pool = AgentPool::new(AgentPoolConfig {
            key_scope: PoolKeyScope::Exact,
            ..Default::default()
        });
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let a = pool
            .get_or_create(
                test_config(HandlerType::Completion, "m1").with_temperature(0.1),
                &factory,
            )
            .await
            .unwrap();
        let b = pool
            .get_or_create(
                test_config(HandlerType::Completion, "m1").with_temperature(0.9),
                &factory,
            )
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(counters.created(), 2);
    }

    #[test]
    fn test_pool_key_format() {
        let config = test_config(HandlerType::WebSearch, "m1");
        let key = PoolKey::for_config(&config, PoolKeyScope::Coarse);
        assert_eq!(key.as_str(), "web_search|m1|hosted_model");
    }

    #[test]
    fn test_exact_key_is_stable_across_parameter_order() {
        let a = test_config(HandlerType::ThirdPartyApi, "m1")
            .with_parameter("a", serde_json::json!(1))
            .with_parameter("b", serde_json::json!(2));
        let b = test_config(HandlerType::ThirdPartyApi, "m1")
            .with_parameter("b", serde_json::json!(2))
            .with_parameter("a", serde_json::json!(1));

        assert_eq!(
            PoolKey::for_config(&a, PoolKeyScope::Exact),
            PoolKey::for_config(&b, PoolKeyScope::Exact)
        );
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let pool = pool_with(2);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let a = pool
            .get_or_create(test_config(HandlerType::Completion, "a"), &factory)
            .await
            .unwrap();
        let b = pool
            .get_or_create(test_config(HandlerType::Completion, "b"), &factory)
            .await
            .unwrap();

        // Touch "a" so "b" becomes least recently used
        pool.get_or_create(test_config(HandlerType::Completion, "a"), &factory)
            .await
            .unwrap();
        pool.get_or_create(test_config(HandlerType::Completion, "c"), &factory)
            .await
            .unwrap();
        settle().await;

        assert_eq!(pool.len(), 2);
        assert!(a.is_healthy());
        assert!(!b.is_healthy());
        assert_eq!(counters.cleanups(), 1);

        let again = pool
            .get_or_create(test_config(HandlerType::Completion, "a"), &factory)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(pool.stats(HandlerType::Completion).unwrap().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_replaced() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let first = pool
            .get_or_create(test_config(HandlerType::Translation, "m1"), &factory)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        let second = pool
            .get_or_create(test_config(HandlerType::Translation, "m1"), &factory)
            .await
            .unwrap();
        settle().await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(counters.cleanups(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_entry_is_replaced() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        let first = pool
            .get_or_create(test_config(HandlerType::CodeExecution, "m1"), &factory)
            .await
            .unwrap();

        counters.unhealthy.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(!first.check_health().await);
        counters.unhealthy.store(false, std::sync::atomic::Ordering::SeqCst);

        let second = pool
            .get_or_create(test_config(HandlerType::CodeExecution, "m1"), &factory)
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_create_one_instance() {
        let pool = Arc::new(pool_with(10));
        let counters = Counters::default();
        let factory = Arc::new(slow_init_factory(
            Behavior::Respond("ok".into()),
            counters.clone(),
            Duration::from_millis(50),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            let factory = Arc::clone(&factory);
            handles.push(tokio::spawn(async move {
                pool.get_or_create(test_config(HandlerType::WebSearch, "m1"), factory.as_ref())
                    .await
                    .unwrap()
            }));
        }

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap());
        }

        assert_eq!(counters.created(), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));

        let stats = pool.stats(HandlerType::WebSearch).unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 9);
    }

    #[tokio::test]
    async fn test_creation_failure_is_returned() {
        let pool = pool_with(10);
        let failing = |config: &HandlerConfig| -> Result<Box<dyn crate::runtime::handler::Handler>> {
            Err(EngineError::CreationFailed {
                handler_type: config.handler_type,
                reason: "backend credentials missing".to_string(),
            })
        };

        let result = pool
            .get_or_create(test_config(HandlerType::ThirdPartyApi, "m1"), &failing)
            .await;

        assert!(matches!(result, Err(EngineError::CreationFailed { .. })));
        assert!(pool.is_empty());
        assert_eq!(pool.stats(HandlerType::ThirdPartyApi).unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let pool = pool_with(10);
        let factory = mock_factory(Behavior::Respond("ok".into()), Counters::default());
        let mut config = test_config(HandlerType::Completion, "m1");
        config.name.clear();

        let result = pool.get_or_create(config, &factory).await;
        assert!(matches!(result, Err(EngineError::InvalidHandlerConfig(_))));
    }

    #[tokio::test]
    async fn test_evict_schedules_cleanup() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());
        let config = test_config(HandlerType::Completion, "m1");
        let key = pool.key_for(&config);

        pool.get_or_create(config, &factory).await.unwrap();

        assert!(pool.evict(HandlerType::Completion, &key));
        assert!(!pool.evict(HandlerType::Completion, &key));
        settle().await;

        assert!(pool.is_empty());
        assert_eq!(counters.cleanups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_and_unhealthy() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        pool.get_or_create(test_config(HandlerType::Completion, "old"), &factory)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        pool.get_or_create(test_config(HandlerType::Completion, "new"), &factory)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(15 * 60)).await;

        assert_eq!(pool.sweep().await, 1);
        settle().await;
        assert_eq!(pool.len(), 1);

        counters.unhealthy.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(pool.sweep().await, 1);
        settle().await;
        assert!(pool.is_empty());
        assert_eq!(counters.cleanups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_start_stop_idempotent() {
        let pool = Arc::new(AgentPool::new(AgentPoolConfig {
            sweep_interval_secs: 60,
            max_age_secs: 30,
            ..Default::default()
        }));
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        pool.start_sweeper();
        pool.start_sweeper();
        assert!(pool.is_sweeping());

        pool.get_or_create(test_config(HandlerType::Completion, "m1"), &factory)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(pool.is_empty());

        pool.stop_sweeper();
        pool.stop_sweeper();
        assert!(!pool.is_sweeping());

        pool.start_sweeper();
        assert!(pool.is_sweeping());
        pool.stop_sweeper();
    }

    #[tokio::test]
    async fn test_clear_all_cleans_every_instance() {
        let pool = pool_with(10);
        let counters = Counters::default();
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        for model in ["a", "b", "c"] {
            pool.get_or_create(test_config(HandlerType::Completion, model), &factory)
                .await
                .unwrap();
        }
        pool.get_or_create(test_config(HandlerType::UrlRetrieval, "a"), &factory)
            .await
            .unwrap();

        assert_eq!(pool.shutdown().await, 4);
        assert!(pool.is_empty());
        assert_eq!(counters.cleanups(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cleanups_do_not_block_maintenance() {
        let pool = pool_with(2);
        let counters = Counters::default();
        counters.fail_cleanup.store(true, std::sync::atomic::Ordering::SeqCst);
        let factory = mock_factory(Behavior::Respond("ok".into()), counters.clone());

        // LRU insertion
        for model in ["a", "b", "c"] {
            pool.get_or_create(test_config(HandlerType::Completion, model), &factory)
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(pool.len(), 2);
        assert_eq!(counters.cleanups(), 1);

        // Explicit eviction
        let key = pool.key_for(&test_config(HandlerType::Completion, "b"));
        assert!(pool.evict(HandlerType::Completion, &key));
        settle().await;
        assert_eq!(pool.len(), 1);
        assert_eq!(counters.cleanups(), 2);

        // Sweep
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(pool.sweep().await, 1);
        settle().await;
        assert!(pool.is_empty());
        assert_eq!(counters.cleanups(), 3);

        // Pool keeps serving after the failures
        let fresh = pool
            .get_or_create(test_config(HandlerType::Completion, "d"), &factory)
            .await
            .unwrap();
        assert!(fresh.execute(crate::runtime::test_support::test_context("q")).await.success);
        pool.get_or_create(test_config(HandlerType::Translation, "e"), &factory)
            .await
            .unwrap();

        // Teardown
        assert_eq!(pool.clear_all().await, 2);
        assert!(pool.is_empty());
        assert_eq!(counters.cleanups(), 5);
        assert_eq!(pool.stats(HandlerType::Completion).unwrap().evictions, 3);
    }

    #[tokio::test]
    async fn test_stats_hit_rate_is_exact() {
        let pool = pool_with(10);
        let factory = mock_factory(Behavior::Respond("ok".into()), Counters::default());

        for _ in 0..4 {
            pool.get_or_create(test_config(HandlerType::Completion, "m1"), &factory)
                .await
                .unwrap();
        }

        let stats = pool.stats(HandlerType::Completion).unwrap();
        assert_eq!(stats.hit_rate, 0.75);
        assert_eq!(stats.miss_rate, 0.25);
        assert_eq!(stats.idle_instances, 1);
        assert_eq!(stats.active_instances, 0);
        assert!(pool.stats(HandlerType::Translation).is_none());
        assert_eq!(pool.all_stats().len(), 1);
    }

    #[tokio::test]
    async fn test_global_pool_is_shared() {
        let a = AgentPool::global();
        let b = AgentPool::global();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(AgentPool::init_global(Arc::new(pool_with(1))).is_err());
    }

    proptest! {
        #[test]
        fn prop_pool_never_exceeds_max_size(
            max_size in 1usize..5,
            models in proptest::collection::vec(0u8..8, 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let pool = pool_with(max_size);
                let factory = mock_factory(Behavior::Respond("ok".into()), Counters::default());

                for model in models {
                    pool.get_or_create(
                        test_config(HandlerType::Completion, &format!("m{}", model)),
                        &factory,
                    )
                    .await
                    .unwrap();
                    prop_assert!(pool.len() <= max_size);
                }
                Ok(())
            })?;
        }
    }
}
