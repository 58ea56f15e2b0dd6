//! [`ResourceFactory`]: cache-backed, timeout-bounded resource construction.
//!
//! # Concurrency
//!
//! - The cache has its own lock and every critical section on it is short.
//!   Builds run outside of it.
//! - Concurrent misses for the same key share one in-flight build (a
//!   `OnceCell` per key).  If the caller driving the build is cancelled, one
//!   of the waiters takes it over; the flight is untracked once its last
//!   caller leaves.
//! - Refresh and shutdown take the lifecycle lock exclusively and bump the
//!   generation.  A build that started under an older generation is released
//!   instead of cached and its callers retry, so nobody receives a
//!   pre-refresh resource once the refresh has completed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::cache::{Insertion, SharedLru};
use crate::error::{BuildError, CacheError, FactoryError};
use crate::lifecycle::{ExecutionContext, RefreshListener};
use crate::metrics::{BuildOutcome, Metrics};
use crate::resolver::RepositoryIdentifier;

use super::{ManagedResource, ResourceBuilder};

/// Build budget used when none is configured.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryOptions {
    /// Maximum number of cached resources.
    pub max_size: usize,
    /// Upper bound on a single build.
    pub build_timeout: Duration,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            max_size: 64,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

/// Factory lifecycle state.
///
/// `Uninitialized → Active → (Invalidating → Active)* → Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Active,
    Invalidating,
    Shutdown,
}

/// Point-in-time view of the factory, reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryStats {
    pub phase: Phase,
    pub generation: u64,
    pub cached: usize,
    pub capacity: usize,
    pub in_flight: usize,
}

struct Lifecycle {
    phase: Phase,
    generation: u64,
}

/// Result of one build, shared with every caller that joined it.
enum Attempt<R> {
    Ready(Arc<R>),
    Failed(FactoryError),
    /// A refresh happened while building; the result was discarded.
    Stale,
}

struct Flight<R> {
    generation: u64,
    cell: OnceCell<Attempt<R>>,
}

// ---------------------------------------------------------------------------
// ResourceFactory
// ---------------------------------------------------------------------------

/// Hands out cached resources keyed by repository, building them on demand.
pub struct ResourceFactory<B: ResourceBuilder> {
    builder: B,
    cache: SharedLru<RepositoryIdentifier, Arc<B::Resource>>,
    build_timeout: Duration,
    lifecycle: RwLock<Lifecycle>,
    flights: Mutex<HashMap<RepositoryIdentifier, Arc<Flight<B::Resource>>>>,
    metrics: Arc<Metrics>,
}

impl<B: ResourceBuilder> ResourceFactory<B> {
    /// Create a factory in the `Uninitialized` phase.
    ///
    /// Fails when `options.max_size` is zero.
    pub fn new(builder: B, options: FactoryOptions, metrics: Arc<Metrics>) -> Result<Self, CacheError> {
        Ok(Self {
            builder,
            cache: SharedLru::new(options.max_size)?,
            build_timeout: options.build_timeout,
            lifecycle: RwLock::new(Lifecycle {
                phase: Phase::Uninitialized,
                generation: 0,
            }),
            flights: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn build_timeout(&self) -> Duration {
        self.build_timeout
    }

    /// Subscribe to `ctx` so each refresh event invalidates the cache, and
    /// move from `Uninitialized` to `Active`.
    pub async fn attach(self: &Arc<Self>, ctx: &ExecutionContext) {
        self.activate().await;
        ctx.subscribe(Arc::clone(self) as Arc<dyn RefreshListener>);
    }

    /// Whether `id` is currently cached.  Does not count as a use.
    pub fn is_cached(&self, id: &RepositoryIdentifier) -> bool {
        self.cache.peek_contains(id)
    }

    /// Return the resource for `id`, building and caching it on a miss.
    ///
    /// A hit promotes `id` to most recently used.  A miss builds the resource
    /// within the build timeout; on timeout or failure nothing is cached.
    #[instrument(skip(self), fields(repo = %id))]
    pub async fn get(&self, id: &RepositoryIdentifier) -> Result<Arc<B::Resource>, FactoryError> {
        loop {
            let generation = {
                let lifecycle = self.lifecycle.read().await;
                match lifecycle.phase {
                    Phase::Shutdown => return Err(FactoryError::Closed),
                    Phase::Uninitialized => None,
                    Phase::Active | Phase::Invalidating => {
                        if let Some(resource) = self.cache.get(id) {
                            self.metrics.cache_hits.inc();
                            debug!("cache hit");
                            return Ok(resource);
                        }
                        Some(lifecycle.generation)
                    }
                }
            };
            let generation = match generation {
                Some(g) => g,
                None => {
                    self.activate().await;
                    continue;
                }
            };

            self.metrics.cache_misses.inc();
            let guard = self.join_flight(id, generation);
            let flight = guard.flight();
            let attempt = flight
                .cell
                .get_or_init(|| self.build_and_insert(id, flight.generation))
                .await;

            match attempt {
                Attempt::Ready(resource) => return Ok(Arc::clone(resource)),
                Attempt::Failed(err) => return Err(err.clone()),
                Attempt::Stale => {
                    debug!("context refreshed during build; retrying");
                }
            }
        }
    }

    /// Release every cached resource and empty the cache.
    ///
    /// Serialised against [`get`](Self::get): once this returns, no caller
    /// can obtain a resource built before it started.  Returns the number of
    /// resources released.
    pub async fn invalidate(&self) -> usize {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.phase == Phase::Shutdown {
            return 0;
        }

        lifecycle.phase = Phase::Invalidating;
        lifecycle.generation += 1;
        let released = self.release_all();
        lifecycle.phase = Phase::Active;

        self.metrics.invalidations.inc();
        info!(
            released,
            generation = lifecycle.generation,
            "resource cache invalidated"
        );
        released
    }

    /// Release everything and refuse further [`get`](Self::get) calls.
    ///
    /// Idempotent; returns the number of resources released.
    pub async fn shutdown(&self) -> usize {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.phase == Phase::Shutdown {
            return 0;
        }

        lifecycle.phase = Phase::Shutdown;
        lifecycle.generation += 1;
        let released = self.release_all();

        info!(released, "resource factory shut down");
        released
    }

    pub async fn stats(&self) -> FactoryStats {
        let lifecycle = self.lifecycle.read().await;
        FactoryStats {
            phase: lifecycle.phase,
            generation: lifecycle.generation,
            cached: self.cache.len(),
            capacity: self.cache.capacity(),
            in_flight: self.flights().len(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn activate(&self) {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.phase == Phase::Uninitialized {
            lifecycle.phase = Phase::Active;
            info!(
                capacity = self.cache.capacity(),
                build_timeout = ?self.build_timeout,
                "resource factory active"
            );
        }
    }

    /// Find the in-flight build for `id` or start tracking a new one.
    ///
    /// A flight from an older generation, or one that already finished, is
    /// replaced; an unfinished one from the same or a newer generation is
    /// joined since its result is current.
    fn join_flight(&self, id: &RepositoryIdentifier, generation: u64) -> FlightGuard<'_, B> {
        let mut flights = self.flights();
        let flight = match flights.get(id) {
            Some(flight) if flight.generation >= generation && !flight.cell.initialized() => {
                Arc::clone(flight)
            }
            _ => {
                let flight = Arc::new(Flight {
                    generation,
                    cell: OnceCell::new(),
                });
                flights.insert(id.clone(), Arc::clone(&flight));
                flight
            }
        };
        FlightGuard {
            factory: self,
            id: id.clone(),
            flight: Some(flight),
        }
    }

    async fn build_and_insert(&self, id: &RepositoryIdentifier, generation: u64) -> Attempt<B::Resource> {
        // A flight that finished just before this one was started may already
        // have cached the resource.
        if let Some(resource) = self.cache.get(id) {
            debug!("resource cached by an earlier flight");
            return Attempt::Ready(resource);
        }

        let started = Instant::now();

        let built = tokio::time::timeout(self.build_timeout, self.builder.build(id)).await;
        self.metrics
            .build_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let resource = match built {
            Err(_elapsed) => {
                warn!(timeout = ?self.build_timeout, "resource build timed out");
                self.metrics.record_build(BuildOutcome::Timeout);
                return Attempt::Failed(FactoryError::ConstructionTimeout {
                    repo: id.to_string(),
                    timeout: self.build_timeout,
                });
            }
            Ok(Err(err)) => {
                warn!(error = %err, "resource build failed");
                self.metrics.record_build(BuildOutcome::Failed);
                return Attempt::Failed(FactoryError::ConstructionFailure {
                    repo: id.to_string(),
                    not_found: matches!(err, BuildError::NotFound(_)),
                    reason: format!("{err:#}"),
                });
            }
            Ok(Ok(resource)) => Arc::new(resource),
        };

        let lifecycle = self.lifecycle.read().await;
        if lifecycle.phase == Phase::Shutdown || lifecycle.generation != generation {
            let closed = lifecycle.phase == Phase::Shutdown;
            drop(lifecycle);
            self.metrics.record_build(BuildOutcome::Stale);
            self.release(id, &resource);
            return if closed {
                Attempt::Failed(FactoryError::Closed)
            } else {
                Attempt::Stale
            };
        }

        match self.cache.insert(id.clone(), Arc::clone(&resource)) {
            Insertion::Inserted => {}
            Insertion::Updated(previous) => self.release(id, &previous),
            Insertion::Evicted(evicted_id, evicted) => {
                self.metrics.cache_evictions.inc();
                debug!(evicted = %evicted_id, "evicted least recently used resource");
                self.release(&evicted_id, &evicted);
            }
        }
        self.metrics.cache_entries.set(self.cache.len() as i64);
        self.metrics.record_build(BuildOutcome::Ok);
        debug!(elapsed = ?started.elapsed(), "resource built and cached");

        Attempt::Ready(resource)
    }

    /// Drain the cache and release every entry.  Caller holds the lifecycle
    /// write lock.
    fn release_all(&self) -> usize {
        self.flights().clear();
        let entries = self.cache.drain();
        for (id, resource) in &entries {
            self.release(id, resource);
        }
        self.metrics.cache_entries.set(0);
        entries.len()
    }

    fn release(&self, id: &RepositoryIdentifier, resource: &B::Resource) {
        self.metrics.releases.inc();
        if let Err(err) = resource.release() {
            self.metrics.release_failures.inc();
            warn!(repo = %id, error = %err, "failed to release resource");
        }
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<RepositoryIdentifier, Arc<Flight<B::Resource>>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A caller's membership in an in-flight build.
///
/// The last member to leave removes the flight from the table, whether the
/// build finished or every caller was cancelled.  Clones of the flight are
/// only taken or dropped under the flights lock, so the strong count read
/// there is exact.
struct FlightGuard<'a, B: ResourceBuilder> {
    factory: &'a ResourceFactory<B>,
    id: RepositoryIdentifier,
    flight: Option<Arc<Flight<B::Resource>>>,
}

impl<B: ResourceBuilder> FlightGuard<'_, B> {
    fn flight(&self) -> &Flight<B::Resource> {
        self.flight
            .as_deref()
            .unwrap_or_else(|| unreachable!("flight taken before drop"))
    }
}

impl<B: ResourceBuilder> Drop for FlightGuard<'_, B> {
    fn drop(&mut self) {
        let mut flights = self.factory.flights();
        if let Some(flight) = self.flight.take() {
            let tracked = flights.get(&self.id).is_some_and(|f| Arc::ptr_eq(f, &flight));
            // The table and this guard hold the only references.
            if tracked && Arc::strong_count(&flight) == 2 {
                flights.remove(&self.id);
            }
            drop(flight);
        }
    }
}

#[async_trait::async_trait]
impl<B: ResourceBuilder> RefreshListener for ResourceFactory<B> {
    async fn context_refreshed(&self, epoch: u64) {
        let released = self.invalidate().await;
        debug!(epoch, released, "handled context refresh");
    }
}
