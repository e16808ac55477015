//! Response caching with request coalescing.
//!
//! Each cache key holds at most one in-flight computation: concurrent
//! callers for the same key await a shared future instead of issuing
//! duplicate relay queries. Computations run on a spawned task so they
//! finish and fill the cache even when every caller gives up waiting.
//! The apps listing additionally serves stale entries while a refresh runs
//! in the background, since ranking drift there is harmless.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use thiserror::Error;
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};

use crate::catalog::{AppListing, CatalogService, StackDetail, StackPage};
use crate::models::{App, AppStack, Release};
use crate::sink::Sink;

/// Apps listing freshness window.
const APPS_TTL: Duration = Duration::from_secs(30);
/// Stack listing and detail freshness window.
const STACKS_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CacheError(pub String);

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

type ComputeFuture<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct State<T> {
    entries: HashMap<String, Entry<T>>,
    inflight: HashMap<String, ComputeFuture<T>>,
}

/// TTL map with per-key coalescing of the recompute.
///
/// `T` must be `Sync` as well as `Send`: waiters poll a [`Shared`] handle to
/// the in-flight result from multiple tasks at once.
pub struct TtlCache<T: Clone + Send + Sync + 'static> {
    ttl: Duration,
    /// Serve an expired entry immediately and refresh behind it.
    stale_ok: bool,
    state: Arc<Mutex<State<T>>>,
}

impl<T: Clone + Send + Sync + 'static> TtlCache<T> {
    pub fn new(ttl: Duration, stale_ok: bool) -> Self {
        Self {
            ttl,
            stale_ok,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                inflight: HashMap::new(),
            })),
        }
    }

    /// Return the cached value for `key`, or run `compute` to fill it.
    /// A failed computation is delivered to every waiter of this round and
    /// is not cached; the next call starts fresh.
    pub async fn get<F>(&self, key: &str, compute: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let shared = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if let Some(entry) = state.entries.get(key) {
                if now.duration_since(entry.stored_at) < self.ttl {
                    return Ok(entry.value.clone());
                }
                if self.stale_ok {
                    let stale = entry.value.clone();
                    if !state.inflight.contains_key(key) {
                        let fut = self.spawn_compute(key.to_string(), compute);
                        state.inflight.insert(key.to_string(), fut);
                    }
                    return Ok(stale);
                }
            }
            match state.inflight.get(key) {
                Some(fut) => fut.clone(),
                None => {
                    let fut = self.spawn_compute(key.to_string(), compute);
                    state.inflight.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    fn spawn_compute<F>(&self, key: String, compute: F) -> ComputeFuture<T>
    where
        F: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let state = self.state.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = compute.await;
            let mut s = state.lock().await;
            if let Ok(value) = &result {
                s.entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
            s.inflight.remove(&key);
            drop(s);
            let _ = tx.send(result);
        });
        rx.map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(CacheError("cache computation dropped".into())),
        })
        .boxed()
        .shared()
    }
}

/// Cached front for [`CatalogService`]: list and detail responses are
/// memoized, and every relay-sourced seed event goes to the sink.
pub struct CachedCatalog {
    catalog: Arc<CatalogService>,
    sink: Sink,
    apps: TtlCache<Arc<AppListing>>,
    stacks: TtlCache<Arc<StackPage>>,
    stack_detail: TtlCache<Arc<Option<StackDetail>>>,
}

impl CachedCatalog {
    pub fn new(catalog: Arc<CatalogService>, sink: Sink) -> Self {
        Self {
            catalog,
            sink,
            apps: TtlCache::new(APPS_TTL, true),
            stacks: TtlCache::new(STACKS_TTL, false),
            stack_detail: TtlCache::new(STACKS_TTL, false),
        }
    }

    pub async fn apps(&self, limit: usize, until: Option<u64>) -> Result<Arc<AppListing>, CacheError> {
        let key = format!("apps:{limit}:{}", cursor_key(until));
        let catalog = self.catalog.clone();
        let sink = self.sink.clone();
        self.apps
            .get(&key, async move {
                let listing = catalog
                    .apps_by_release(limit, until)
                    .map_err(|e| CacheError(e.to_string()))?;
                sink.persist(listing.seed_events.clone());
                Ok(Arc::new(listing))
            })
            .await
    }

    pub async fn stacks(
        &self,
        limit: usize,
        until: Option<u64>,
        authors: Option<Vec<String>>,
    ) -> Result<Arc<StackPage>, CacheError> {
        let key = format!(
            "stacks:{limit}:{}:{}",
            cursor_key(until),
            authors.as_deref().map(|a| a.join(",")).unwrap_or_default()
        );
        let catalog = self.catalog.clone();
        let sink = self.sink.clone();
        self.stacks
            .get(&key, async move {
                let page = catalog
                    .stacks(limit, until, authors)
                    .await
                    .map_err(|e| CacheError(e.to_string()))?;
                sink.persist(page.seed_events.clone());
                Ok(Arc::new(page))
            })
            .await
    }

    pub async fn stack(
        &self,
        pubkey: &str,
        identifier: &str,
    ) -> Result<Arc<Option<StackDetail>>, CacheError> {
        let key = format!("stack:{pubkey}:{identifier}");
        let catalog = self.catalog.clone();
        let sink = self.sink.clone();
        let pubkey = pubkey.to_string();
        let identifier = identifier.to_string();
        self.stack_detail
            .get(&key, async move {
                let detail = catalog
                    .stack(&pubkey, &identifier)
                    .await
                    .map_err(|e| CacheError(e.to_string()))?;
                if let Some(detail) = &detail {
                    sink.persist(detail.seed_events.clone());
                }
                Ok(Arc::new(detail))
            })
            .await
    }

    /// Uncached pass-throughs. Detail and history queries are rare enough
    /// that memoizing them buys nothing.
    pub async fn app(&self, pubkey: &str, identifier: &str) -> Result<Option<App>, CacheError> {
        self.catalog
            .app(pubkey, identifier)
            .await
            .map_err(|e| CacheError(e.to_string()))
    }

    pub async fn releases(
        &self,
        pubkey: &str,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<Release>, CacheError> {
        self.catalog
            .releases_for_app(pubkey, identifier, limit)
            .await
            .map_err(|e| CacheError(e.to_string()))
    }

    pub async fn latest_release(
        &self,
        pubkey: &str,
        identifier: &str,
    ) -> Result<Option<Release>, CacheError> {
        self.catalog
            .latest_release_for_app(pubkey, identifier)
            .await
            .map_err(|e| CacheError(e.to_string()))
    }

    pub fn apps_by_author(&self, pubkey: &str, limit: usize) -> Result<Vec<App>, CacheError> {
        self.catalog
            .apps_by_author(pubkey, limit)
            .map_err(|e| CacheError(e.to_string()))
    }

    pub fn stacks_by_author(&self, pubkey: &str, limit: usize) -> Result<Vec<AppStack>, CacheError> {
        self.catalog
            .stacks_by_author(pubkey, limit)
            .map_err(|e| CacheError(e.to_string()))
    }
}

fn cursor_key(until: Option<u64>) -> String {
    match until {
        Some(t) => t.to_string(),
        None => "first".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    fn counting_compute(
        counter: Arc<AtomicUsize>,
        value: &str,
    ) -> impl Future<Output = Result<String, CacheError>> + Send + 'static {
        let value = value.to_string();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_gets_compute_once() {
        let cache = Arc::new(TtlCache::<String>::new(Duration::from_secs(30), false));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = vec![];
        for _ in 0..10 {
            let cache = cache.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                cache.get("k", counting_compute(counter, "v")).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "v");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_triggers_recompute() {
        let cache = TtlCache::<String>::new(Duration::from_secs(30), false);
        let counter = Arc::new(AtomicUsize::new(0));
        let v = cache
            .get("k", counting_compute(counter.clone(), "one"))
            .await
            .unwrap();
        assert_eq!(v, "one");
        advance(Duration::from_secs(10)).await;
        let v = cache
            .get("k", counting_compute(counter.clone(), "two"))
            .await
            .unwrap();
        assert_eq!(v, "one");
        advance(Duration::from_secs(31)).await;
        let v = cache
            .get("k", counting_compute(counter.clone(), "two"))
            .await
            .unwrap();
        assert_eq!(v, "two");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_served_while_refreshing() {
        let cache = TtlCache::<String>::new(Duration::from_secs(30), true);
        let counter = Arc::new(AtomicUsize::new(0));
        cache
            .get("k", counting_compute(counter.clone(), "old"))
            .await
            .unwrap();
        advance(Duration::from_secs(31)).await;

        // Stale hit answers immediately with the old value.
        let v = cache
            .get("k", counting_compute(counter.clone(), "new"))
            .await
            .unwrap();
        assert_eq!(v, "old");

        // Once the background refresh lands, the new value is served.
        sleep(Duration::from_millis(50)).await;
        let v = cache
            .get("k", counting_compute(counter.clone(), "unused"))
            .await
            .unwrap();
        assert_eq!(v, "new");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_not_cached() {
        let cache = TtlCache::<String>::new(Duration::from_secs(30), false);
        let err = cache
            .get("k", async { Err(CacheError("relay down".into())) })
            .await;
        assert!(err.is_err());
        let counter = Arc::new(AtomicUsize::new(0));
        let v = cache
            .get("k", counting_compute(counter.clone(), "ok"))
            .await
            .unwrap();
        assert_eq!(v, "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn computation_outlives_abandoned_caller() {
        let cache = Arc::new(TtlCache::<String>::new(Duration::from_secs(30), false));
        let counter = Arc::new(AtomicUsize::new(0));
        let task = {
            let cache = cache.clone();
            let counter = counter.clone();
            tokio::spawn(async move { cache.get("k", counting_compute(counter, "v")).await })
        };
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;
        // The spawned computation still fills the cache.
        sleep(Duration::from_millis(50)).await;
        let v = cache
            .get("k", async { Err(CacheError("should not run".into())) })
            .await
            .unwrap();
        assert_eq!(v, "v");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let cache = TtlCache::<String>::new(Duration::from_secs(30), false);
        let counter = Arc::new(AtomicUsize::new(0));
        cache
            .get("a", counting_compute(counter.clone(), "va"))
            .await
            .unwrap();
        cache
            .get("b", counting_compute(counter.clone(), "vb"))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let v = cache
            .get("a", counting_compute(counter.clone(), "x"))
            .await
            .unwrap();
        assert_eq!(v, "va");
    }
}
