//! Reactive keyed fetch cache with deduplication, revalidation, and coordinated mutation.
//!
//! nanoquery lets you declare **fetcher stores**: reactive stores bound to a composite key and an async fetch
//! function. The instance guarantees that only one fetch per logical key is in flight across all subscribers, shares
//! results through a time-bounded cache, and serves *stale* data while it is *revalidated* in the background.
//! Revalidation can be driven by an interval (gated by a visibility signal), window focus, network reconnection, or
//! explicit invalidation.
//!
//! A store's **key** is a sequence of parts: fixed scalars, reactive [`Atom`]s, or other fetcher stores. Parts resolve
//! to their string forms and concatenate into the *canonical key*; a part resolving to `None` disables the store
//! until it resolves again. When reactive parts change, the key recomputes (coalescing same-tick writes into one
//! recomputation) and the store re-evaluates, refetching if needed.
//!
//! **Mutator stores** wrap async mutation functions that cooperate with the cache: they can optimistically rewrite
//! cache entries and queue invalidations that run once the mutation settles.
//!
//! To create an instance you need [`Options`] and optionally a [`Runtime`] and a [`Signals`] source. The `Runtime`
//! connects nanoquery to an async runtime like [`tokio`] so it can run fetches in the background; `Signals` supplies
//! the visibility/focus/online events revalidation reacts to, and defaults to [`NullSignals`] ("always visible, never
//! reconnects") outside of browser-like hosts.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # #[derive(PartialEq)]
//! # struct Todo;
//! # async fn http_get(path: &str) -> Result<Todo, nanoquery::BoxError> { Ok(Todo) }
//! # #[tokio::main]
//! # async fn main() {
//! let nq: nanoquery::Nanoquery = nanoquery::new(nanoquery::Options {
//! 	dedupe_time: Duration::from_secs(2),
//! 	..Default::default()
//! });
//!
//! let id = nanoquery::Atom::new(Some(1u32));
//! let todo = nq.fetcher(("/api/todos/", &id), |parts| async move {
//! 	http_get(&parts.concat()).await
//! });
//!
//! let _sub = todo.subscribe(|state| {
//! 	if let Some(todo) = &state.data {
//! 		// render
//! 	}
//! });
//!
//! id.set(Some(2)); // re-resolves the key and refetches
//! # }
//! ```
//!
//! # Runtimes
//! nanoquery provides [`Runtime`] implementations for the following async runtimes:
//! - **[`tokio`]** - [`runtime::Tokio`]/[`runtime::TokioHandle`] (available with the `tokio` Cargo feature **and
//!   enabled by default**)
//! - **[`smol`]** - [`runtime::Smol`] (available with the `smol` Cargo feature)
//! - *write your own by implementing [`Runtime`]!*
//!
//! [`nanoquery::new`][crate::new] creates an instance using the *default runtime*. With default Cargo features this
//! is the `tokio` runtime, and you must set up your application to create a `tokio` runtime before using nanoquery.
//! If you enable multiple runtime features, or none, you must specify the runtime with
//! [`nanoquery::new_in`][crate::new_in] instead.
//!
//! # Other Cargo features
//! - **`tracing`**: Enables logging when fetches occur/keys are invalidated, via [`tracing`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rust_2024_compatibility)]
#![allow(clippy::tabs_in_doc_comments)]
#![warn(missing_docs)]

use std::{
	collections::{HashMap, HashSet},
	future::Future,
	sync::{
		Arc, Once, Weak,
		atomic::{AtomicU64, Ordering}
	}
};

use parking_lot::{Mutex, RwLock};

pub mod atom;
pub(crate) mod cache;
pub(crate) mod error;
pub mod events;
pub(crate) mod fetcher;
pub(crate) mod key;
pub(crate) mod mutator;
pub(crate) mod options;
pub mod runtime;
pub(crate) mod util;

use self::{
	cache::{CacheEntry, CacheStore, FetchPayload},
	fetcher::{ActiveStore, Trigger},
	runtime::{DefaultRuntime, RuntimeDefault},
	util::Instant
};
pub use self::{
	atom::{Atom, Subscription},
	cache::CacheSeed,
	error::{BoxError, Error, MismatchedTypeError, SharedError},
	events::{NullSignals, Signals},
	fetcher::{ErasedFetcher, FetcherState, FetcherStore, erased_fetcher},
	key::{IntoKeyPart, IntoKeyParts, KeyFragment, KeyPart, KeySelector},
	mutator::{CacheUpdater, MutationContext, MutatorOptions, MutatorState, MutatorStore},
	options::{ErrorCallback, Options, OptionsPatch, RetryEvent, RetryPolicy},
	runtime::Runtime
};

pub(crate) struct NanoqueryInner<R: Runtime> {
	pub(crate) runtime: R,
	pub(crate) signals: Box<dyn Signals>,
	pub(crate) cache: CacheStore,
	me: Weak<NanoqueryInner<R>>,

	defaults: Options,
	overrule: RwLock<OptionsPatch>,

	/// Presence marks an in-flight fetch; at-most-one-per-key is enforced by `begin_flight`'s insert.
	inflight: Mutex<HashSet<Arc<str>>>,
	/// Keys whose next resolution must bypass the dedupe window.
	forced: Mutex<HashSet<Arc<str>>>,
	/// Consecutive failure counts per key. Reset by any success.
	retries: Mutex<HashMap<Arc<str>, u32>>,
	/// Active fetcher stores by canonical key, for invalidation and cache-write fan-out.
	registry: Mutex<HashMap<Arc<str>, Vec<(u64, Weak<dyn ActiveStore>)>>>,

	store_seq: AtomicU64,
	signals_installed: Once
}

impl<R: Runtime> NanoqueryInner<R> {
	pub(crate) fn next_store_id(&self) -> u64 {
		self.store_seq.fetch_add(1, Ordering::Relaxed)
	}

	pub(crate) fn resolve_options(&self, store: &OptionsPatch) -> options::ResolvedOptions {
		let overrule = self.overrule.read();
		options::ResolvedOptions::layer(&self.defaults, store, &overrule)
	}

	pub(crate) fn default_on_error(&self) -> Option<ErrorCallback> {
		self.resolve_options(&OptionsPatch::default()).on_error
	}

	/// Lazily installs the focus/reconnect listeners on first use; they remain for the instance's lifetime.
	pub(crate) fn install_signals(&self) {
		self.signals_installed.call_once(|| {
			let weak = self.me.clone();
			self.signals.on_focus(Box::new(move || {
				if let Some(ctx) = weak.upgrade() {
					ctx.external_revalidate(Trigger::Focus);
				}
			}));
			let weak = self.me.clone();
			self.signals.on_reconnect(Box::new(move || {
				if let Some(ctx) = weak.upgrade() {
					ctx.external_revalidate(Trigger::Reconnect);
				}
			}));
		});
	}

	fn external_revalidate(&self, trigger: Trigger) {
		for store in self.all_active() {
			let wants = match trigger {
				Trigger::Focus => store.wants_focus(),
				Trigger::Reconnect => store.wants_reconnect(),
				_ => false
			};
			if wants {
				store.refresh(trigger);
			}
		}
	}

	pub(crate) fn register(&self, key: Arc<str>, id: u64, store: Weak<dyn ActiveStore>) {
		self.registry.lock().entry(key).or_default().push((id, store));
	}

	pub(crate) fn deregister(&self, key: &str, id: u64) {
		let mut registry = self.registry.lock();
		if let Some(bucket) = registry.get_mut(key) {
			bucket.retain(|(entry_id, store)| *entry_id != id && store.strong_count() > 0);
			if bucket.is_empty() {
				registry.remove(key);
			}
		}
	}

	pub(crate) fn reregister(&self, old: Option<Arc<str>>, new: Option<Arc<str>>, id: u64, store: Weak<dyn ActiveStore>) {
		if let Some(old) = old {
			self.deregister(&old, id);
		}
		if let Some(new) = new {
			self.register(new, id, store);
		}
	}

	fn registry_snapshot(&self, key: &str) -> Vec<Arc<dyn ActiveStore>> {
		let mut registry = self.registry.lock();
		let Some(bucket) = registry.get_mut(key) else {
			return Vec::new();
		};
		bucket.retain(|(_, store)| store.strong_count() > 0);
		bucket.iter().filter_map(|(_, store)| store.upgrade()).collect()
	}

	fn all_active(&self) -> Vec<Arc<dyn ActiveStore>> {
		let registry = self.registry.lock();
		registry.values().flatten().filter_map(|(_, store)| store.upgrade()).collect()
	}

	pub(crate) fn flight_active(&self, key: &Arc<str>) -> bool {
		self.inflight.lock().contains(key)
	}

	pub(crate) fn begin_flight(&self, key: &Arc<str>) -> bool {
		self.inflight.lock().insert(Arc::clone(key))
	}

	pub(crate) fn end_flight(&self, key: &Arc<str>) {
		self.inflight.lock().remove(key);
	}

	pub(crate) fn force(&self, key: &Arc<str>) {
		self.forced.lock().insert(Arc::clone(key));
	}

	pub(crate) fn take_forced(&self, key: &Arc<str>) -> bool {
		self.forced.lock().remove(key)
	}

	pub(crate) fn bump_retries(&self, key: &Arc<str>) -> u32 {
		let mut retries = self.retries.lock();
		let count = retries.entry(Arc::clone(key)).or_insert(0);
		*count += 1;
		*count
	}

	pub(crate) fn reset_retries(&self, key: &Arc<str>) {
		self.retries.lock().remove(key);
	}

	pub(crate) fn fan_out_settled(&self, key: &Arc<str>) {
		for store in self.registry_snapshot(key) {
			store.settled(key);
		}
	}

	/// Republishes the key's current cache entry to active stores, clearing any revalidating flag.
	pub(crate) fn republish(&self, key: &Arc<str>) {
		for store in self.registry_snapshot(key) {
			store.cache_written(key, false);
		}
	}

	/// Writes (or, with `None`, deletes) a cache entry and republishes it to every active store on the key.
	pub(crate) fn write_cache(&self, key: &Arc<str>, value: Option<FetchPayload>, revalidating: bool) {
		match value {
			Some(payload) => {
				let lifetime = self.resolve_options(&OptionsPatch::default()).cache_lifetime;
				self.cache.set(Arc::clone(key), CacheEntry::with_data(payload, Instant::now(), lifetime));
			}
			None => self.cache.delete(key)
		}
		for store in self.registry_snapshot(key) {
			store.cache_written(key, revalidating);
		}
	}

	/// Resolves a selector against the keys present in the cache or with active subscribers.
	fn matching_keys(&self, selector: &KeySelector) -> Vec<Arc<str>> {
		let mut keys = self.cache.scan(|key| selector.matches(key));
		let registered: Vec<Arc<str>> = self.registry.lock().keys().cloned().collect();
		for key in registered {
			if selector.matches(&key) && !keys.iter().any(|k| *k == key) {
				keys.push(key);
			}
		}
		keys
	}

	pub(crate) fn invalidate_selector(&self, selector: &KeySelector) {
		for key in self.matching_keys(selector) {
			#[cfg(feature = "tracing")]
			{
				tracing::debug!(key = %key, "key invalidated");
			}

			self.cache.delete(&key);
			self.force(&key);
			for store in self.registry_snapshot(&key) {
				store.invalidated();
			}
		}
	}

	pub(crate) fn revalidate_selector(&self, selector: &KeySelector) {
		for key in self.matching_keys(selector) {
			#[cfg(feature = "tracing")]
			{
				tracing::debug!(key = %key, "key revalidated");
			}

			self.force(&key);
			for store in self.registry_snapshot(&key) {
				store.refresh(Trigger::Revalidate);
			}
		}
	}
}

/// A nanoquery instance: the cache, the registry of active stores, and the factories for fetcher and mutator stores.
///
/// Instances are self-contained; two instances share no cache, registry, or event listeners.
///
/// # Cloning
/// `Nanoquery` is internally reference counted via [`Arc`], so it can be cheaply cloned.
pub struct Nanoquery<R: Runtime = DefaultRuntime> {
	inner: Arc<NanoqueryInner<R>>
}

impl<R: Runtime> Clone for Nanoquery<R> {
	fn clone(&self) -> Self {
		Nanoquery { inner: Arc::clone(&self.inner) }
	}
}

impl<R: Runtime> Nanoquery<R> {
	/// Creates a new instance with [`NullSignals`].
	///
	/// To use this constructor, the [`Runtime`] (`R`) must implement [`Default`], which is the case when using the
	/// [default runtime][crate#runtimes] (i.e. not specifying `R`).
	#[inline]
	pub fn new(options: Options) -> Self
	where
		R: RuntimeDefault
	{
		Self::new_in(options, R::default(), NullSignals)
	}

	/// Creates a new instance using a non-default [`Runtime`] and a [`Signals`] source.
	pub fn new_in<S: Signals>(mut options: Options, runtime: R, signals: S) -> Self {
		let seeds = std::mem::take(&mut options.cache);
		let inner = Arc::new_cyclic(|me| NanoqueryInner {
			runtime,
			signals: Box::new(signals) as Box<dyn Signals>,
			cache: CacheStore::new(),
			me: me.clone(),

			defaults: options,
			overrule: RwLock::new(OptionsPatch::default()),

			inflight: Mutex::new(HashSet::new()),
			forced: Mutex::new(HashSet::new()),
			retries: Mutex::new(HashMap::new()),
			registry: Mutex::new(HashMap::new()),

			store_seq: AtomicU64::new(0),
			signals_installed: Once::new()
		});

		for (key, seed) in seeds {
			let entry = seed.into_entry(inner.defaults.cache_lifetime);
			inner.cache.set(Arc::from(key), entry);
		}

		Nanoquery { inner }
	}

	/// Creates a fetcher store for the given key specification and fetch function.
	///
	/// The fetch function receives the resolved string form of each key part, in order.
	pub fn fetcher<T, K, F, Fut>(&self, keys: K, fetch: F) -> FetcherStore<T, R>
	where
		T: PartialEq + Send + Sync + 'static,
		K: IntoKeyParts,
		F: Fn(Vec<Arc<str>>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, BoxError>> + Send + 'static
	{
		self.fetcher_with(keys, fetch, OptionsPatch::default())
	}

	/// Creates a fetcher store with per-store option overrides.
	pub fn fetcher_with<T, K, F, Fut>(&self, keys: K, fetch: F, overrides: OptionsPatch) -> FetcherStore<T, R>
	where
		T: PartialEq + Send + Sync + 'static,
		K: IntoKeyParts,
		F: Fn(Vec<Arc<str>>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, BoxError>> + Send + 'static
	{
		FetcherStore::create(Arc::clone(&self.inner), keys.into_key_parts(), Some(erased_fetcher(fetch)), overrides)
	}

	/// Creates a fetcher store that fetches through the instance-wide [`Options::fetcher`].
	///
	/// If the instance configured no fetcher, the store publishes [`Error::MissingFetcher`] when a fetch is required.
	pub fn fetcher_from_default<T, K>(&self, keys: K) -> FetcherStore<T, R>
	where
		T: PartialEq + Send + Sync + 'static,
		K: IntoKeyParts
	{
		self.fetcher_from_default_with(keys, OptionsPatch::default())
	}

	/// Like [`Nanoquery::fetcher_from_default`], with per-store option overrides.
	pub fn fetcher_from_default_with<T, K>(&self, keys: K, overrides: OptionsPatch) -> FetcherStore<T, R>
	where
		T: PartialEq + Send + Sync + 'static,
		K: IntoKeyParts
	{
		FetcherStore::create(Arc::clone(&self.inner), keys.into_key_parts(), None, overrides)
	}

	/// Creates a mutator store wrapping `action`.
	pub fn mutator<D, T, F, Fut>(&self, action: F) -> MutatorStore<D, T, R>
	where
		D: Send + 'static,
		T: Send + Sync + 'static,
		F: Fn(MutationContext<D, R>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, BoxError>> + Send + 'static
	{
		self.mutator_with(action, MutatorOptions::default())
	}

	/// Creates a mutator store with per-store options.
	pub fn mutator_with<D, T, F, Fut>(&self, action: F, options: MutatorOptions) -> MutatorStore<D, T, R>
	where
		D: Send + 'static,
		T: Send + Sync + 'static,
		F: Fn(MutationContext<D, R>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, BoxError>> + Send + 'static
	{
		MutatorStore::create(Arc::clone(&self.inner), action, options)
	}

	/// Invalidates every key matched by `selector` among the keys present in the cache or with active subscribers.
	///
	/// Keys with active subscribers refetch immediately, with their displayed data dropped; keys without lose their
	/// cache entry so the next subscription refetches.
	pub fn invalidate_keys(&self, selector: impl Into<KeySelector>) {
		self.inner.invalidate_selector(&selector.into());
	}

	/// Like [`Nanoquery::invalidate_keys`], but stale data remains on display while refetches are in flight.
	pub fn revalidate_keys(&self, selector: impl Into<KeySelector>) {
		self.inner.revalidate_selector(&selector.into());
	}

	/// Writes `value` into every cache key matched by `selector` (or deletes the entries when `value` is `None`) and
	/// republishes to active stores.
	pub fn mutate_cache<V: Send + Sync + 'static>(&self, selector: impl Into<KeySelector>, value: Option<V>) {
		let payload = value.map(FetchPayload::new);
		let selector = selector.into();
		for key in self.inner.matching_keys(&selector) {
			self.inner.write_cache(&key, payload.clone(), false);
		}
	}

	/// Replaces the settings overlay applied on top of instance defaults and per-store overrides for all subsequent
	/// engine decisions.
	///
	/// This exists for tests; production code should configure stores through [`Options`] and [`OptionsPatch`].
	#[doc(hidden)]
	pub fn overrule_settings(&self, patch: OptionsPatch) {
		*self.inner.overrule.write() = patch;
	}
}

/// Creates a new nanoquery instance with [`NullSignals`].
///
/// To use this constructor, the [`Runtime`] (`R`) must implement [`Default`], which is the case when using the
/// [default runtime][crate#runtimes] (i.e. not specifying `R`).
#[inline(always)]
pub fn new<R: Runtime + RuntimeDefault>(options: Options) -> Nanoquery<R> {
	Nanoquery::new(options)
}

/// Creates a new nanoquery instance using a non-default [`Runtime`] and a [`Signals`] source.
#[inline(always)]
pub fn new_in<R: Runtime, S: Signals>(options: Options, runtime: R, signals: S) -> Nanoquery<R> {
	Nanoquery::new_in(options, runtime, signals)
}
