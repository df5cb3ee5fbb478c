//! TTL cache with per-key single-flight and stale-while-revalidate.
//!
//! A sharded map keeps contention local; each slot carries the cached
//! value and, while a discovery is running, a completion handle that late
//! callers await instead of starting their own probe. Entries inside the
//! last tenth of their TTL are returned immediately while one background
//! refresh runs; a failed refresh extends the entry by a grace period
//! instead of evicting it.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mcpgrid_mcp::Tool;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const SHARD_COUNT: usize = 16;

/// Default TTLs per the discovery tier that produced the entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const STATIC_TTL: Duration = Duration::from_secs(60 * 60);
/// Extension applied when a background refresh fails.
pub const REFRESH_GRACE: Duration = Duration::from_secs(5 * 60);

/// Which tier answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Cache,
    Http,
    Stdio,
    Static,
    None,
}

/// What a discovery run produced (before caching).
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub tools: Vec<Tool>,
    pub method: DiscoveryMethod,
}

impl LoadResult {
    pub fn none() -> Self {
        Self {
            tools: Vec::new(),
            method: DiscoveryMethod::None,
        }
    }
}

/// What a caller gets back.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub tools: Vec<Tool>,
    pub method: DiscoveryMethod,
}

/// Boxed discovery future; the factory is invoked once per actual probe
/// (foreground leader or background refresher).
pub type LoaderFuture = Pin<Box<dyn Future<Output = LoadResult> + Send>>;
pub type Loader = Arc<dyn Fn() -> LoaderFuture + Send + Sync>;

struct CacheEntry {
    tools: Vec<Tool>,
    timestamp: Instant,
    ttl: Duration,
    /// Template-registry generation the entry was built against; a refresh
    /// of the registry invalidates it.
    generation: u64,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    in_flight: Option<broadcast::Sender<LoadResult>>,
}

pub struct ToolCache {
    shards: Vec<Mutex<HashMap<String, Slot>>>,
    ttl: Duration,
    static_ttl: Duration,
    grace: Duration,
}

enum Action {
    Hit(DiscoveryResult),
    /// Serve the stale value and refresh behind the caller's back.
    HitRevalidate(DiscoveryResult, broadcast::Sender<LoadResult>),
    Wait(broadcast::Receiver<LoadResult>),
    Lead(broadcast::Sender<LoadResult>),
}

impl ToolCache {
    pub fn new() -> Self {
        Self::with_ttls(DEFAULT_TTL, STATIC_TTL, REFRESH_GRACE)
    }

    pub fn with_ttls(ttl: Duration, static_ttl: Duration, grace: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
            static_ttl,
            grace,
        }
    }

    /// Look up `key`, coalescing concurrent misses onto one loader run.
    pub async fn get_or_load(
        self: &Arc<Self>,
        key: &str,
        generation: u64,
        refresh: bool,
        loader: Loader,
    ) -> DiscoveryResult {
        loop {
            let action = self.decide(key, generation, refresh);

            match action {
                Action::Hit(result) => return result,
                Action::HitRevalidate(result, tx) => {
                    let cache = Arc::clone(self);
                    let key = key.to_string();
                    let loader = Arc::clone(&loader);
                    tokio::spawn(async move {
                        let load = loader().await;
                        cache.finish_flight(&key, generation, load, tx, true);
                    });
                    return result;
                }
                Action::Wait(mut rx) => match rx.recv().await {
                    Ok(load) => {
                        return DiscoveryResult {
                            tools: load.tools,
                            method: load.method,
                        }
                    }
                    // Leader vanished without publishing; take over.
                    Err(_) => continue,
                },
                Action::Lead(tx) => {
                    let load = loader().await;
                    return self.finish_flight(key, generation, load, tx, false);
                }
            }
        }
    }

    fn decide(&self, key: &str, generation: u64, refresh: bool) -> Action {
        let mut shard = self.shard(key).lock().expect("cache shard lock");
        let slot = shard.entry(key.to_string()).or_default();

        // A registry refresh since the entry was written invalidates it.
        if slot
            .entry
            .as_ref()
            .is_some_and(|entry| entry.generation != generation)
        {
            debug!(key, "cache entry from an older template generation, discarding");
            slot.entry = None;
        }

        if !refresh {
            if let Some(entry) = &slot.entry {
                let age = entry.timestamp.elapsed();
                if age < entry.ttl {
                    let result = DiscoveryResult {
                        tools: entry.tools.clone(),
                        method: DiscoveryMethod::Cache,
                    };
                    // Final 10% of the TTL: revalidate in the background.
                    let revalidate_after = entry.ttl.mul_f64(0.9);
                    if age >= revalidate_after && slot.in_flight.is_none() {
                        let (tx, _) = broadcast::channel(1);
                        slot.in_flight = Some(tx.clone());
                        return Action::HitRevalidate(result, tx);
                    }
                    return Action::Hit(result);
                }
            }
        }

        if let Some(tx) = &slot.in_flight {
            Action::Wait(tx.subscribe())
        } else {
            let (tx, _) = broadcast::channel(1);
            slot.in_flight = Some(tx.clone());
            Action::Lead(tx)
        }
    }

    fn finish_flight(
        &self,
        key: &str,
        generation: u64,
        load: LoadResult,
        tx: broadcast::Sender<LoadResult>,
        background: bool,
    ) -> DiscoveryResult {
        {
            let mut shard = self.shard(key).lock().expect("cache shard lock");
            let slot = shard.entry(key.to_string()).or_default();
            slot.in_flight = None;

            match load.method {
                DiscoveryMethod::None => {
                    if background {
                        // Keep the stale value alive a little longer and let
                        // the next access retry.
                        if let Some(entry) = &mut slot.entry {
                            entry.timestamp += self.grace;
                            warn!(key, "background refresh failed, extending stale entry");
                        }
                    }
                }
                method => {
                    let ttl = if method == DiscoveryMethod::Static {
                        self.static_ttl
                    } else {
                        self.ttl
                    };
                    slot.entry = Some(CacheEntry {
                        tools: load.tools.clone(),
                        timestamp: Instant::now(),
                        ttl,
                        generation,
                    });
                }
            }
        }

        let _ = tx.send(load.clone());
        DiscoveryResult {
            tools: load.tools,
            method: load.method,
        }
    }

    /// Drop a key outright (explicit invalidation).
    pub fn invalidate(&self, key: &str) {
        let mut shard = self.shard(key).lock().expect("cache shard lock");
        if let Some(slot) = shard.get_mut(key) {
            slot.entry = None;
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Slot>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::Value::Null,
        }
    }

    /// Loader that counts invocations and returns a fixed result.
    fn counting_loader(
        counter: Arc<AtomicUsize>,
        result: LoadResult,
        delay: Duration,
    ) -> Loader {
        Arc::new(move || {
            let counter = counter.clone();
            let result = result.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result
            })
        })
    }

    #[tokio::test]
    async fn miss_loads_then_hit_serves_from_cache() {
        let cache = Arc::new(ToolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("say_hello")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );

        let first = cache.get_or_load("demo", 0, false, loader.clone()).await;
        assert_eq!(first.method, DiscoveryMethod::Http);
        assert_eq!(first.tools.len(), 1);

        let second = cache.get_or_load("demo", 0, false, loader).await;
        assert_eq!(second.method, DiscoveryMethod::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_bypasses_the_cache() {
        let cache = Arc::new(ToolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("echo")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );

        cache.get_or_load("demo", 0, false, loader.clone()).await;
        let refreshed = cache.get_or_load("demo", 0, true, loader.clone()).await;
        assert_eq!(refreshed.method, DiscoveryMethod::Http);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // And the refreshed value is cached again.
        let after = cache.get_or_load("demo", 0, false, loader).await;
        assert_eq!(after.method, DiscoveryMethod::Cache);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_probe() {
        let cache = Arc::new(ToolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("slow")],
                method: DiscoveryMethod::Stdio,
            },
            Duration::from_millis(100),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loader = loader.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_load("demo", 0, false, loader).await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.tools.len(), 1);
            assert!(matches!(
                result.method,
                DiscoveryMethod::Stdio | DiscoveryMethod::Cache
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "single-flight violated");
    }

    #[tokio::test]
    async fn generation_change_invalidates() {
        let cache = Arc::new(ToolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("x")],
                method: DiscoveryMethod::Static,
            },
            Duration::ZERO,
        );

        cache.get_or_load("demo", 0, false, loader.clone()).await;
        let next_gen = cache.get_or_load("demo", 1, false, loader).await;
        assert_eq!(next_gen.method, DiscoveryMethod::Static);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn explicit_invalidation_forces_reload() {
        let cache = Arc::new(ToolCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![],
                method: DiscoveryMethod::Static,
            },
            Duration::ZERO,
        );

        cache.get_or_load("demo", 0, false, loader.clone()).await;
        cache.invalidate("demo");
        cache.get_or_load("demo", 0, false, loader).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_reloads() {
        let cache = Arc::new(ToolCache::with_ttls(
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(10),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("x")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );

        cache.get_or_load("demo", 0, false, loader.clone()).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let reloaded = cache.get_or_load("demo", 0, false, loader).await;
        assert_eq!(reloaded.method, DiscoveryMethod::Http);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn near_expiry_serves_stale_and_revalidates_in_background() {
        let cache = Arc::new(ToolCache::with_ttls(
            Duration::from_millis(1000),
            Duration::from_millis(1000),
            Duration::from_millis(100),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("x")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );

        cache.get_or_load("demo", 0, false, loader.clone()).await;

        // Sit inside the last 10% of the TTL.
        tokio::time::sleep(Duration::from_millis(930)).await;
        let stale = cache.get_or_load("demo", 0, false, loader.clone()).await;
        assert_eq!(stale.method, DiscoveryMethod::Cache, "stale value served");

        // The background refresh runs exactly once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Entry was renewed: well past the original expiry it still hits.
        let renewed = cache.get_or_load("demo", 0, false, loader).await;
        assert_eq!(renewed.method, DiscoveryMethod::Cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_background_refresh_extends_the_entry() {
        let cache = Arc::new(ToolCache::with_ttls(
            Duration::from_millis(1000),
            Duration::from_millis(1000),
            Duration::from_millis(2000),
        ));
        let good_calls = Arc::new(AtomicUsize::new(0));
        let good = counting_loader(
            good_calls.clone(),
            LoadResult {
                tools: vec![tool("x")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );
        let failing: Loader = Arc::new(|| Box::pin(async { LoadResult::none() }));

        cache.get_or_load("demo", 0, false, good.clone()).await;

        tokio::time::sleep(Duration::from_millis(930)).await;
        let stale = cache.get_or_load("demo", 0, false, failing).await;
        assert_eq!(stale.method, DiscoveryMethod::Cache);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Past the original TTL, but the grace extension keeps it alive.
        let extended = cache.get_or_load("demo", 0, false, good).await;
        assert_eq!(extended.method, DiscoveryMethod::Cache);
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_foreground_load_is_not_cached() {
        let cache = Arc::new(ToolCache::new());
        let failing: Loader = Arc::new(|| Box::pin(async { LoadResult::none() }));
        let result = cache.get_or_load("demo", 0, false, failing.clone()).await;
        assert_eq!(result.method, DiscoveryMethod::None);
        assert!(result.tools.is_empty());

        // Next access tries again rather than hitting a cached failure.
        let calls = Arc::new(AtomicUsize::new(0));
        let good = counting_loader(
            calls.clone(),
            LoadResult {
                tools: vec![tool("x")],
                method: DiscoveryMethod::Http,
            },
            Duration::ZERO,
        );
        let result = cache.get_or_load("demo", 0, false, good).await;
        assert_eq!(result.method, DiscoveryMethod::Http);
    }
}
