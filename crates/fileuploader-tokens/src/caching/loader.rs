use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::utils::defer::defer;

/// A load that is shared by everybody looking up the same key while it runs.
pub type PendingLoad<I, E> = Shared<BoxFuture<'static, Result<I, E>>>;

/// Describes how items of a [`CacheLoader`] are loaded and when they become invalid.
pub trait CacheItemRequest: 'static + Send + Sync {
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    type Item: Clone + Send + Sync + 'static;
    type Error: Clone + fmt::Display + From<oneshot::Canceled> + Send + Sync + 'static;

    /// The name of this cache, used in logs and as metrics tag.
    const NAME: &'static str;

    /// Loads a fresh item for `key`.
    ///
    /// The loader makes sure that this is never called while another load for the same key is
    /// still running.
    fn load(&self, key: Self::Key) -> BoxFuture<'static, Result<Self::Item, Self::Error>>;

    /// Checks whether an item may still be handed out.
    ///
    /// Cached items failing this check are evicted and loaded again. Freshly loaded items failing
    /// it are still handed to everybody waiting for that load, but they are not cached.
    fn validate(&self, _item: &Self::Item) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The result of [`CacheLoader::lookup`].
pub enum Lookup<I, E> {
    /// A valid cached item.
    Cached(I),
    /// An item that is being loaded.
    Loading(PendingLoad<I, E>),
}

impl<I: Clone, E: Clone> Lookup<I, E> {
    /// Waits for the item, if it is still being loaded.
    pub async fn resolve(self) -> Result<I, E> {
        match self {
            Self::Cached(item) => Ok(item),
            Self::Loading(load) => load.await,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }
}

impl<I: fmt::Debug, E> fmt::Debug for Lookup<I, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached(item) => f.debug_tuple("Cached").field(item).finish(),
            Self::Loading(_) => f.write_str("Loading"),
        }
    }
}

struct InFlight<I, E> {
    /// Distinguishes this load from later loads of the same key.
    id: u64,
    load: PendingLoad<I, E>,
}

struct LoaderState<T: CacheItemRequest> {
    cache: HashMap<T::Key, T::Item>,
    loading: HashMap<T::Key, InFlight<T::Item, T::Error>>,
    next_load_id: u64,
}

impl<T: CacheItemRequest> LoaderState<T> {
    /// Removes the in-flight entry of load `id`, storing its item on success.
    fn settle(&mut self, key: &T::Key, id: u64, result: Option<&T::Item>) {
        if !self.loading.get(key).is_some_and(|in_flight| in_flight.id == id) {
            return;
        }
        self.loading.remove(key);
        if let Some(item) = result {
            self.cache.insert(key.clone(), item.clone());
        }
    }
}

fn lock<T: CacheItemRequest>(state: &Mutex<LoaderState<T>>) -> MutexGuard<'_, LoaderState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Memoizes items of a [`CacheItemRequest`] in memory.
///
/// Concurrent lookups of the same key are deduplicated, see the [module docs](super) for how
/// this works.
pub struct CacheLoader<T: CacheItemRequest> {
    request: Arc<T>,
    state: Arc<Mutex<LoaderState<T>>>,
}

impl<T: CacheItemRequest> Clone for CacheLoader<T> {
    fn clone(&self) -> Self {
        CacheLoader {
            request: Arc::clone(&self.request),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: CacheItemRequest> fmt::Debug for CacheLoader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cached, loading) = self
            .state
            .try_lock()
            .map(|state| (state.cache.len(), state.loading.len()))
            .unwrap_or_default();
        f.debug_struct("CacheLoader")
            .field("name", &T::NAME)
            .field("cached items", &cached)
            .field("running loads", &loading)
            .finish()
    }
}

impl<T: CacheItemRequest> CacheLoader<T> {
    pub fn new(request: T) -> Self {
        CacheLoader {
            request: Arc::new(request),
            state: Arc::new(Mutex::new(LoaderState {
                cache: HashMap::new(),
                loading: HashMap::new(),
                next_load_id: 0,
            })),
        }
    }

    pub fn request(&self) -> &T {
        &self.request
    }

    /// Returns the cached item for `key`, or the load that will produce it.
    ///
    /// This starts a new load only if there is neither a valid cached item nor a running load.
    /// Loads are spawned on the current tokio runtime, so they complete and populate the cache
    /// even if nobody awaits them.
    ///
    /// # Panics
    ///
    /// Panics if a load needs to be started outside of a tokio runtime.
    pub fn lookup(&self, key: &T::Key) -> Lookup<T::Item, T::Error> {
        let name = T::NAME;
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut state = lock(&self.state);

        if let Some(in_flight) = state.loading.get(key) {
            metric!(counter("caches.channel.hit") += 1, "cache" => name);
            tracing::trace!(cache = name, ?key, "Attaching to running load");
            return Lookup::Loading(in_flight.load.clone());
        }

        let cached = state
            .cache
            .get(key)
            .map(|item| self.request.validate(item).map(|()| item.clone()));
        match cached {
            Some(Ok(item)) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return Lookup::Cached(item);
            }
            Some(Err(err)) => {
                metric!(counter("caches.invalid") += 1, "cache" => name);
                tracing::debug!(cache = name, ?key, "Cached value failed validation: {err}");
                state.cache.remove(key);
            }
            None => {}
        }

        // Spawning can only fail with a panic. The lock has to be released before that, since
        // the dropped task settles the load through the same lock.
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                drop(state);
                panic!("cache `{name}` can only load items inside a tokio runtime: {err}");
            }
        };

        metric!(counter("caches.channel.miss") += 1, "cache" => name);
        Lookup::Loading(self.spawn_load(&runtime, &mut state, key.clone()))
    }

    /// Returns the item for `key`, loading it if necessary.
    pub async fn get(&self, key: &T::Key) -> Result<T::Item, T::Error> {
        self.lookup(key).resolve().await
    }

    /// Removes the cached item for `key`.
    ///
    /// A running load is not affected and will populate the cache when done.
    pub fn invalidate(&self, key: &T::Key) -> Option<T::Item> {
        lock(&self.state).cache.remove(key)
    }

    /// The number of cached items, including ones that are no longer valid.
    pub fn len(&self) -> usize {
        lock(&self.state).cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of loads currently running.
    pub fn running_loads(&self) -> usize {
        lock(&self.state).loading.len()
    }

    /// Spawns a load for `key` and registers it as in-flight.
    ///
    /// Must be called with the state locked, after making sure no load for `key` is running.
    fn spawn_load(
        &self,
        runtime: &tokio::runtime::Handle,
        state: &mut LoaderState<T>,
        key: T::Key,
    ) -> PendingLoad<T::Item, T::Error> {
        let id = state.next_load_id;
        state.next_load_id += 1;

        let (sender, receiver) = oneshot::channel();

        // Settles the load in case the task dies without getting to it, for example
        // when the load panics or the runtime shuts down.
        let remove_load_token = {
            let state = Arc::clone(&self.state);
            let key = key.clone();
            defer(move || lock(&state).settle(&key, id, None))
        };

        let request = Arc::clone(&self.request);
        let state_ref = Arc::clone(&self.state);
        let load_key = key.clone();
        let task = async move {
            tracing::debug!(cache = T::NAME, key = ?load_key, "Loading item");
            let result = request.load(load_key.clone()).await;
            let cacheable = match &result {
                Ok(item) => match request.validate(item) {
                    Ok(()) => Some(item),
                    Err(err) => {
                        tracing::debug!(
                            cache = T::NAME,
                            key = ?load_key,
                            "Loaded item is already invalid, not caching it: {err}"
                        );
                        None
                    }
                },
                Err(err) => {
                    tracing::debug!(cache = T::NAME, key = ?load_key, "Load failed: {err}");
                    None
                }
            };

            // Storing the result and leaving the in-flight map happen under the same lock, so
            // lookups see either this load or its result.
            lock(&state_ref).settle(&load_key, id, cacheable);
            drop(remove_load_token);

            sender.send(result).ok();
        };
        runtime.spawn(task);

        let load = receiver
            .map(|result| result.unwrap_or_else(|canceled| Err(canceled.into())))
            .boxed()
            .shared();
        state.loading.insert(
            key,
            InFlight {
                id,
                load: load.clone(),
            },
        );
        load
    }
}
