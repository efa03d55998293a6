use std::{
	future::Future,
	pin::Pin,
	sync::{
		Arc, Weak,
		atomic::{AtomicBool, Ordering}
	},
	time::Duration
};

use parking_lot::{Mutex, RwLock};

#[cfg(feature = "tracing")]
use crate::util::Instant;
use crate::{
	NanoqueryInner,
	atom::Subscription,
	cache::{CacheEntry, FetchPayload},
	error::{BoxError, Error, SharedError},
	key::{IntoKeyPart, KeyPart, KeySelector, KeySource, PartImpl, ResolvedKey, resolve_parts},
	options::{OptionsPatch, ResolvedOptions, RetryEvent},
	runtime::{DefaultRuntime, Runtime},
	util::{Listeners, TimerSlot}
};

/// The boxed future produced by an [`ErasedFetcher`].
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<FetchPayload, BoxError>> + Send>>;

/// A type-erased fetch function: receives the resolved string form of each key part, in order, and produces a
/// [`FetchPayload`].
///
/// Typed fetch functions passed to [`Nanoquery::fetcher`][crate::Nanoquery::fetcher] are erased internally; this type
/// only needs constructing directly for [`Options::fetcher`][crate::Options::fetcher], via [`erased_fetcher`].
pub type ErasedFetcher = Arc<dyn Fn(Vec<Arc<str>>) -> FetchFuture + Send + Sync>;

/// Erases a typed fetch function for use as an instance-wide default ([`Options::fetcher`][crate::Options::fetcher]).
pub fn erased_fetcher<T, F, Fut>(fetch: F) -> ErasedFetcher
where
	T: Send + Sync + 'static,
	F: Fn(Vec<Arc<str>>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<T, BoxError>> + Send + 'static
{
	Arc::new(move |parts| {
		let fut = fetch(parts);
		Box::pin(async move { fut.await.map(FetchPayload::new) })
	})
}

/// Why the engine is re-evaluating a store's state. Used for logging and to decide which pending timers to cancel.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Trigger {
	FirstUse,
	KeyChange,
	Invalidate,
	Revalidate,
	Interval,
	Focus,
	Reconnect,
	Retry
}

impl Trigger {
	#[cfg(feature = "tracing")]
	fn describe(self) -> &'static str {
		match self {
			Trigger::FirstUse => "first subscriber",
			Trigger::KeyChange => "key change",
			Trigger::Invalidate => "invalidation",
			Trigger::Revalidate => "revalidation",
			Trigger::Interval => "revalidate interval",
			Trigger::Focus => "window focus",
			Trigger::Reconnect => "network reconnect",
			Trigger::Retry => "error retry"
		}
	}
}

/// The interface the registry uses to fan events out to active fetcher stores.
pub(crate) trait ActiveStore: Send + Sync {
	fn wants_focus(&self) -> bool;
	fn wants_reconnect(&self) -> bool;
	/// Re-evaluates state, observing the dedupe window.
	fn refresh(&self, trigger: Trigger);
	/// The key was invalidated: clear displayed data and refetch.
	fn invalidated(&self);
	/// A fetch for `key` reached a terminal outcome; republish from the cache.
	fn settled(&self, key: &Arc<str>);
	/// The cache entry for `key` was externally written or deleted.
	fn cache_written(&self, key: &Arc<str>, revalidating: bool);
}

/// The published value of a [`FetcherStore`].
pub struct FetcherState<T> {
	/// The most recent successful value for the current key, possibly stale while a refresh is in flight.
	pub data: Option<Arc<T>>,
	/// The most recent terminal error for the current key. Never present while `loading` is `true`.
	pub error: Option<Error>,
	/// Whether a fetch for the current key is in flight.
	pub loading: bool,
	/// The current canonical key, or `None` while the key is disabled.
	pub key: Option<Arc<str>>
}

impl<T> Clone for FetcherState<T> {
	fn clone(&self) -> Self {
		FetcherState {
			data: self.data.clone(),
			error: self.error.clone(),
			loading: self.loading,
			key: self.key.clone()
		}
	}
}

impl<T> Default for FetcherState<T> {
	fn default() -> Self {
		FetcherState {
			data: None,
			error: None,
			loading: false,
			key: None
		}
	}
}

impl<T: std::fmt::Debug> std::fmt::Debug for FetcherState<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FetcherState")
			.field("data", &self.data)
			.field("error", &self.error)
			.field("loading", &self.loading)
			.field("key", &self.key)
			.finish()
	}
}

impl<T: PartialEq> FetcherState<T> {
	/// Whole-state identity: equal states must not re-notify subscribers.
	fn same_as(&self, other: &FetcherState<T>) -> bool {
		self.loading == other.loading
			&& self.key == other.key
			&& match (&self.data, &other.data) {
				(Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
				(None, None) => true,
				_ => false
			} && match (&self.error, &other.error) {
				(Some(a), Some(b)) => a.same_as(b),
				(None, None) => true,
				_ => false
			}
	}
}

/// A reactive store bound to a composite key and a fetch function.
///
/// The store is inert until its first subscriber attaches; from then until the last subscriber detaches, it resolves
/// its key from its reactive parts, keeps at most one fetch in flight per canonical key (shared with every other
/// store on that key), serves cached data inside the dedupe window, and revalidates on the configured triggers.
///
/// `FetcherStore` is cheaply cloneable; clones share state and subscriber lifecycle.
pub struct FetcherStore<T: Send + Sync + 'static, R: Runtime = DefaultRuntime> {
	pub(crate) inner: Arc<FetcherInner<T, R>>
}

impl<T: Send + Sync + 'static, R: Runtime> Clone for FetcherStore<T, R> {
	fn clone(&self) -> Self {
		FetcherStore { inner: Arc::clone(&self.inner) }
	}
}

pub(crate) struct FetcherInner<T: Send + Sync + 'static, R: Runtime> {
	ctx: Arc<NanoqueryInner<R>>,
	id: u64,
	parts: Vec<KeyPart>,
	fetch: Option<ErasedFetcher>,
	overrides: OptionsPatch,
	me: Weak<FetcherInner<T, R>>,

	state: RwLock<FetcherState<T>>,
	listeners: Listeners<FetcherState<T>>,
	key_watchers: Listeners<()>,

	resolved: RwLock<Option<ResolvedKey>>,
	recompute_pending: AtomicBool,
	part_subs: Mutex<Vec<Subscription>>,

	refresh_task: Mutex<TimerSlot<R>>,
	retry_task: Mutex<TimerSlot<R>>
}

impl<T, R> FetcherStore<T, R>
where
	T: PartialEq + Send + Sync + 'static,
	R: Runtime
{
	pub(crate) fn create(ctx: Arc<NanoqueryInner<R>>, parts: Vec<KeyPart>, fetch: Option<ErasedFetcher>, overrides: OptionsPatch) -> Self {
		let id = ctx.next_store_id();
		let runtime = ctx.runtime.clone();
		let inner = Arc::new_cyclic(|me| FetcherInner {
			ctx,
			id,
			parts,
			fetch,
			overrides,
			me: me.clone(),

			state: RwLock::new(FetcherState::default()),
			listeners: Listeners::new(),
			key_watchers: Listeners::new(),

			resolved: RwLock::new(None),
			recompute_pending: AtomicBool::new(false),
			part_subs: Mutex::new(Vec::new()),

			refresh_task: Mutex::new(TimerSlot::new(runtime.clone())),
			retry_task: Mutex::new(TimerSlot::new(runtime))
		});
		FetcherStore { inner }
	}

	/// Returns a snapshot of the store's current published value.
	pub fn get(&self) -> FetcherState<T> {
		self.inner.state.read().clone()
	}

	/// Returns the store's current canonical key, or `None` while the key is disabled.
	pub fn key(&self) -> Option<Arc<str>> {
		self.inner.canonical_key()
	}

	/// Registers a listener invoked on every published state change.
	///
	/// The first listener activates the store; dropping the returned [`Subscription`] detaches the listener, and the
	/// store deactivates when the last one detaches.
	pub fn listen(&self, cb: impl Fn(&FetcherState<T>) + Send + Sync + 'static) -> Subscription {
		self.inner.add_listener(Arc::new(cb))
	}

	/// Like [`FetcherStore::listen`], but also immediately invokes the listener with the current value.
	pub fn subscribe(&self, cb: impl Fn(&FetcherState<T>) + Send + Sync + 'static) -> Subscription {
		let cb: Arc<dyn Fn(&FetcherState<T>) + Send + Sync> = Arc::new(cb);
		let sub = self.inner.add_listener(Arc::clone(&cb));
		cb(&self.get());
		sub
	}

	/// Invalidates the store's current key: displayed data is dropped, the dedupe window is bypassed, and active
	/// subscribers trigger an immediate refetch.
	pub fn invalidate(&self) {
		if let Some(key) = self.key() {
			self.inner.ctx.invalidate_selector(&KeySelector::Exact(key));
		}
	}

	/// Revalidates the store's current key: like [`FetcherStore::invalidate`], but stale data remains on display
	/// while the refetch is in flight.
	pub fn revalidate(&self) {
		if let Some(key) = self.key() {
			self.inner.ctx.revalidate_selector(&KeySelector::Exact(key));
		}
	}

	/// Replaces the cache entry for the store's current key with `value` and republishes to every active store on
	/// that key.
	pub fn mutate(&self, value: T) {
		if let Some(key) = self.key() {
			self.inner.ctx.write_cache(&key, Some(FetchPayload::new(value)), false);
		}
	}
}

impl<T, R> FetcherInner<T, R>
where
	T: PartialEq + Send + Sync + 'static,
	R: Runtime
{
	fn is_active(&self) -> bool {
		!self.listeners.is_empty()
	}

	fn opts(&self) -> ResolvedOptions {
		self.ctx.resolve_options(&self.overrides)
	}

	fn canonical_key(&self) -> Option<Arc<str>> {
		if let Some(resolved) = self.resolved.read().as_ref() {
			return Some(Arc::clone(&resolved.key));
		}
		resolve_parts(&self.parts).map(|resolved| resolved.key)
	}

	fn key_in_force(&self, key: &Arc<str>) -> bool {
		self.resolved.read().as_ref().is_some_and(|resolved| resolved.key == *key)
	}

	fn add_listener(&self, cb: Arc<dyn Fn(&FetcherState<T>) + Send + Sync>) -> Subscription {
		let (key, first) = self.listeners.add(cb);
		if first {
			self.mount();
		}
		let weak = self.me.clone();
		Subscription::new(move || {
			if let Some(inner) = weak.upgrade() {
				if inner.listeners.remove(key) {
					inner.unmount();
				}
			}
		})
	}

	/// Activates the store: subscribes to reactive key parts, registers with the registry, and runs the first state
	/// resolution.
	fn mount(&self) {
		let Some(me) = self.me.upgrade() else {
			return;
		};

		let mut subs = Vec::new();
		for part in &self.parts {
			let weak = Arc::downgrade(&me);
			if let Some(sub) = part.watch(Box::new(move || {
				if let Some(inner) = weak.upgrade() {
					inner.schedule_recompute();
				}
			})) {
				subs.push(sub);
			}
		}
		*self.part_subs.lock() = subs;

		let resolved = resolve_parts(&self.parts);
		*self.resolved.write() = resolved.clone();
		if let Some(resolved) = &resolved {
			self.ctx.register(Arc::clone(&resolved.key), self.id, self.me.clone() as Weak<dyn ActiveStore>);
		}

		let opts = self.opts();
		if opts.revalidate_on_focus || opts.revalidate_on_reconnect {
			self.ctx.install_signals();
		}
		if !opts.revalidate_interval.is_zero() {
			self.start_interval(opts.revalidate_interval);
		}

		self.evaluate(Trigger::FirstUse);
	}

	/// Deactivates the store, cancelling timers and detaching from reactive inputs. The published value is retained
	/// for a future remount.
	fn unmount(&self) {
		self.part_subs.lock().clear();
		self.refresh_task.lock().cancel();
		self.retry_task.lock().cancel();
		if let Some(resolved) = self.resolved.write().take() {
			self.ctx.deregister(&resolved.key, self.id);
		}
	}

	/// Schedules a coalesced key recomputation on the runtime's next tick. Multiple part changes before the tick fold
	/// into one recomputation.
	fn schedule_recompute(&self) {
		if self.recompute_pending.swap(true, Ordering::AcqRel) {
			return;
		}
		let weak = self.me.clone();
		let runtime = self.ctx.runtime.clone();
		drop(self.ctx.runtime.spawn(async move {
			runtime.yield_now().await;
			let Some(inner) = weak.upgrade() else {
				return;
			};
			inner.recompute_pending.store(false, Ordering::Release);
			inner.recompute_key();
		}));
	}

	fn recompute_key(&self) {
		if !self.is_active() {
			return;
		}
		let next = resolve_parts(&self.parts);
		let (old_key, new_key) = {
			let mut slot = self.resolved.write();
			let old = slot.as_ref().map(|resolved| Arc::clone(&resolved.key));
			let new = next.as_ref().map(|resolved| Arc::clone(&resolved.key));
			*slot = next;
			(old, new)
		};
		if old_key == new_key {
			return;
		}
		// A retry scheduled for the previous key no longer applies.
		self.retry_task.lock().cancel();
		self.ctx.reregister(old_key, new_key, self.id, self.me.clone() as Weak<dyn ActiveStore>);
		self.key_watchers.notify(&());
		self.evaluate(Trigger::KeyChange);
	}

	/// The state resolution procedure: decides between disabled, in-flight sharing, dedupe-window cache hit, and a
	/// fresh fetch.
	fn evaluate(&self, trigger: Trigger) {
		if !self.is_active() {
			return;
		}
		let resolved = self.resolved.read().clone();
		let Some(resolved) = resolved else {
			self.publish(FetcherState::default());
			return;
		};
		let key = Arc::clone(&resolved.key);
		let entry = self.ctx.cache.fresh(&key);

		if self.ctx.flight_active(&key) {
			let data = entry.as_ref().and_then(|e| e.data_as::<T>()).and_then(Result::ok);
			self.publish(FetcherState {
				data,
				error: None,
				loading: true,
				key: Some(key)
			});
			return;
		}

		let opts = self.opts();
		let forced = self.ctx.take_forced(&key);
		if let Some(entry) = &entry {
			if !forced && entry.created.elapsed() < opts.dedupe_time {
				self.publish(self.state_from_entry(entry, &key));
				return;
			}
		}

		let stale = entry.as_ref().and_then(|e| e.data_as::<T>()).and_then(Result::ok);
		self.start_fetch(resolved, stale, &opts, trigger);
	}

	fn start_fetch(&self, resolved: ResolvedKey, stale: Option<Arc<T>>, opts: &ResolvedOptions, trigger: Trigger) {
		let key = Arc::clone(&resolved.key);
		if !self.ctx.begin_flight(&key) {
			// Lost the race to another store on the same key; share its flight.
			self.publish(FetcherState {
				data: stale,
				error: None,
				loading: true,
				key: Some(key)
			});
			return;
		}

		let Some(fetch) = self.fetch.clone().or_else(|| opts.fetcher.clone()) else {
			self.ctx.end_flight(&key);
			self.publish(FetcherState {
				data: None,
				error: Some(Error::MissingFetcher),
				loading: false,
				key: Some(key)
			});
			return;
		};

		#[cfg(feature = "tracing")]
		{
			tracing::debug!(key = %key, "fetch triggered due to: {}", trigger.describe());
		}
		#[cfg(not(feature = "tracing"))]
		let _ = trigger;

		self.publish(FetcherState {
			data: stale,
			error: None,
			loading: true,
			key: Some(Arc::clone(&key))
		});

		let ctx = Arc::clone(&self.ctx);
		let me = self.me.clone();
		let cache_lifetime = opts.cache_lifetime;
		let on_error = opts.on_error.clone();
		let retry_policy = opts.on_error_retry.clone();
		let fut = fetch(resolved.parts);
		drop(self.ctx.runtime.spawn(async move {
			#[cfg(feature = "tracing")]
			let before = Instant::now();

			let res = fut.await;
			ctx.end_flight(&key);
			let now = crate::util::Instant::now();
			match res {
				Ok(payload) => {
					#[cfg(feature = "tracing")]
					{
						tracing::info!(key = %key, "OK {}ms", before.elapsed().as_millis());
					}

					ctx.cache.set(Arc::clone(&key), CacheEntry::with_data(payload, now, cache_lifetime));
					ctx.reset_retries(&key);
					ctx.fan_out_settled(&key);
				}
				Err(err) => {
					let err: SharedError = Arc::from(err);
					#[cfg(feature = "tracing")]
					{
						tracing::info!(key = %key, "ERR {}ms: {err}", before.elapsed().as_millis());
					}

					ctx.cache.set(Arc::clone(&key), CacheEntry::with_error(Arc::clone(&err), now, cache_lifetime));
					if let Some(cb) = &on_error {
						cb(&err, &key);
					}
					ctx.fan_out_settled(&key);

					if let Some(policy) = &retry_policy {
						let retry_count = ctx.bump_retries(&key);
						let event = RetryEvent {
							retry_count,
							error: err,
							key: Arc::clone(&key)
						};
						if let Some(delay) = policy(&event) {
							if !delay.is_zero() {
								if let Some(inner) = me.upgrade() {
									inner.schedule_retry(key, delay);
								}
							}
						}
					}
				}
			}
		}));
	}

	/// Schedules a retry that bypasses the dedupe window but still respects in-flight exclusion. Cancelled by key
	/// changes, explicit invalidation/revalidation, and unmount.
	fn schedule_retry(&self, key: Arc<str>, delay: Duration) {
		let weak = self.me.clone();
		let ctx = Arc::clone(&self.ctx);
		self.retry_task.lock().arm(async move {
			ctx.runtime.wait(delay).await;
			let Some(inner) = weak.upgrade() else {
				return;
			};
			if !inner.is_active() || !inner.key_in_force(&key) {
				return;
			}
			inner.ctx.force(&key);
			inner.evaluate(Trigger::Retry);
		});
	}

	/// Runs interval revalidation while the store is active. Ticks are gated by the visibility signal and still
	/// observe the dedupe window.
	fn start_interval(&self, every: Duration) {
		let weak = self.me.clone();
		let ctx = Arc::clone(&self.ctx);
		self.refresh_task.lock().arm(async move {
			loop {
				ctx.runtime.wait(every).await;
				let Some(inner) = weak.upgrade() else {
					return;
				};
				if !inner.is_active() {
					return;
				}
				if ctx.signals.visible() {
					inner.evaluate(Trigger::Interval);
				}
			}
		});
	}

	/// Builds a terminal (non-loading) state from a cache entry. An error entry keeps whatever data the store
	/// currently displays, per stale-while-revalidate.
	fn state_from_entry(&self, entry: &CacheEntry, key: &Arc<str>) -> FetcherState<T> {
		let mut data = None;
		let mut error = entry.error.clone().map(Error::Fetcher);
		if let Some(res) = entry.data_as::<T>() {
			match res {
				Ok(value) => data = Some(value),
				Err(e) => error = Some(Error::MismatchedType(e))
			}
		}
		if data.is_none() && error.is_some() {
			data = self.state.read().data.clone();
		}
		FetcherState {
			data,
			error,
			loading: false,
			key: Some(Arc::clone(key))
		}
	}

	fn publish(&self, next: FetcherState<T>) {
		{
			let mut state = self.state.write();
			if state.same_as(&next) {
				return;
			}
			*state = next.clone();
		}
		self.listeners.notify(&next);
	}
}

impl<T, R> ActiveStore for FetcherInner<T, R>
where
	T: PartialEq + Send + Sync + 'static,
	R: Runtime
{
	fn wants_focus(&self) -> bool {
		self.opts().revalidate_on_focus
	}

	fn wants_reconnect(&self) -> bool {
		self.opts().revalidate_on_reconnect
	}

	fn refresh(&self, trigger: Trigger) {
		if matches!(trigger, Trigger::Revalidate) {
			self.retry_task.lock().cancel();
		}
		self.evaluate(trigger);
	}

	fn invalidated(&self) {
		if !self.is_active() {
			return;
		}
		self.retry_task.lock().cancel();
		{
			let mut state = self.state.write();
			state.data = None;
			state.error = None;
		}
		self.evaluate(Trigger::Invalidate);
	}

	fn settled(&self, key: &Arc<str>) {
		if !self.is_active() || !self.key_in_force(key) {
			return;
		}
		let Some(entry) = self.ctx.cache.fresh(key) else {
			// The entry was dropped between the settle and this fan-out; end the loading transition as-is.
			let mut next = self.state.read().clone();
			next.loading = false;
			self.publish(next);
			return;
		};
		self.publish(self.state_from_entry(&entry, key));
	}

	fn cache_written(&self, key: &Arc<str>, revalidating: bool) {
		if !self.is_active() || !self.key_in_force(key) {
			return;
		}
		match self.ctx.cache.fresh(key) {
			Some(entry) => {
				let mut next = self.state_from_entry(&entry, key);
				next.loading = revalidating;
				self.publish(next);
			}
			None => self.publish(FetcherState {
				data: None,
				error: None,
				loading: false,
				key: Some(Arc::clone(key))
			})
		}
	}
}

impl<T, R> KeySource for FetcherInner<T, R>
where
	T: PartialEq + Send + Sync + 'static,
	R: Runtime
{
	fn current_key(&self) -> Option<Arc<str>> {
		self.canonical_key()
	}

	fn watch_key(&self, cb: Box<dyn Fn() + Send + Sync>) -> Subscription {
		let cb: Arc<dyn Fn(&()) + Send + Sync> = Arc::new(move |_| cb());
		let (key, _) = self.key_watchers.add(cb);
		let weak = self.me.clone();
		Subscription::new(move || {
			if let Some(inner) = weak.upgrade() {
				inner.key_watchers.remove(key);
			}
		})
	}

	fn hold_active(&self) -> Subscription {
		self.add_listener(Arc::new(|_| {}))
	}
}

impl<T, R> IntoKeyPart for &FetcherStore<T, R>
where
	T: PartialEq + Send + Sync + 'static,
	R: Runtime
{
	fn into_key_part(self) -> KeyPart {
		KeyPart(PartImpl::Store(Arc::clone(&self.inner) as Arc<dyn KeySource>))
	}
}
