use std::{
	future::Future,
	marker::PhantomData,
	pin::Pin,
	sync::{Arc, Weak}
};

use parking_lot::{Mutex, RwLock};

use crate::{
	NanoqueryInner,
	atom::Subscription,
	cache::FetchPayload,
	error::{BoxError, Error},
	key::KeySelector,
	options::ErrorCallback,
	runtime::{DefaultRuntime, Runtime},
	util::{FlightCell, FlightWait, Listeners}
};

/// Options for a single [`MutatorStore`].
#[derive(Clone)]
pub struct MutatorOptions {
	/// When `true` (the default), a `mutate` call while a mutation is already in flight returns the in-flight result
	/// instead of invoking the mutation function again.
	pub throttle_calls: bool,
	/// Invoked on mutation failure. Fully supersedes the instance-wide
	/// [`Options::on_error`][crate::Options::on_error] for this store.
	pub on_error: Option<ErrorCallback>
}

impl Default for MutatorOptions {
	fn default() -> Self {
		MutatorOptions {
			throttle_calls: true,
			on_error: None
		}
	}
}

/// The published value of a [`MutatorStore`].
pub struct MutatorState<T> {
	/// Whether a mutation is in flight.
	pub loading: bool,
	/// The value returned by the most recent successful mutation.
	pub data: Option<Arc<T>>,
	/// The error produced by the most recent failed mutation.
	pub error: Option<Error>
}

impl<T> Clone for MutatorState<T> {
	fn clone(&self) -> Self {
		MutatorState {
			loading: self.loading,
			data: self.data.clone(),
			error: self.error.clone()
		}
	}
}

impl<T> Default for MutatorState<T> {
	fn default() -> Self {
		MutatorState {
			loading: false,
			data: None,
			error: None
		}
	}
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutatorState<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MutatorState")
			.field("loading", &self.loading)
			.field("data", &self.data)
			.field("error", &self.error)
			.finish()
	}
}

type MutationOutcome<T> = Result<Arc<T>, Error>;
type ActionFn<D, T, R> = Arc<dyn Fn(MutationContext<D, R>) -> Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>> + Send + Sync>;

/// A reactive store wrapping an async mutation function.
///
/// The mutation function receives a [`MutationContext`] through which it can optimistically rewrite cache entries and
/// queue invalidations that run once the mutation settles. The store publishes `{loading, data, error}` around each
/// [`MutatorStore::mutate`] call; it is a one-shot result surface, not a cache, and resets when its last subscriber
/// detaches.
///
/// `MutatorStore` is cheaply cloneable; clones share state and the in-flight mutation.
pub struct MutatorStore<D, T: Send + Sync + 'static, R: Runtime = DefaultRuntime> {
	inner: Arc<MutatorInner<D, T, R>>
}

impl<D, T: Send + Sync + 'static, R: Runtime> Clone for MutatorStore<D, T, R> {
	fn clone(&self) -> Self {
		MutatorStore { inner: Arc::clone(&self.inner) }
	}
}

struct MutatorInner<D, T: Send + Sync + 'static, R: Runtime> {
	ctx: Arc<NanoqueryInner<R>>,
	action: ActionFn<D, T, R>,
	options: MutatorOptions,
	me: Weak<MutatorInner<D, T, R>>,

	state: RwLock<MutatorState<T>>,
	listeners: Listeners<MutatorState<T>>,
	flight: Mutex<Option<Arc<FlightCell<MutationOutcome<T>>>>>
}

impl<D, T, R> MutatorStore<D, T, R>
where
	D: Send + 'static,
	T: Send + Sync + 'static,
	R: Runtime
{
	pub(crate) fn create<F, Fut>(ctx: Arc<NanoqueryInner<R>>, action: F, options: MutatorOptions) -> Self
	where
		F: Fn(MutationContext<D, R>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T, BoxError>> + Send + 'static
	{
		let action: ActionFn<D, T, R> = Arc::new(move |context| Box::pin(action(context)));
		let inner = Arc::new_cyclic(|me| MutatorInner {
			ctx,
			action,
			options,
			me: me.clone(),

			state: RwLock::new(MutatorState::default()),
			listeners: Listeners::new(),
			flight: Mutex::new(None)
		});
		MutatorStore { inner }
	}

	/// Returns a snapshot of the store's current published value.
	pub fn get(&self) -> MutatorState<T> {
		self.inner.state.read().clone()
	}

	/// Registers a listener invoked on every published state change.
	///
	/// When the last listener detaches, the store's `data` and `error` reset.
	pub fn listen(&self, cb: impl Fn(&MutatorState<T>) + Send + Sync + 'static) -> Subscription {
		self.inner.add_listener(Arc::new(cb))
	}

	/// Like [`MutatorStore::listen`], but also immediately invokes the listener with the current value.
	pub fn subscribe(&self, cb: impl Fn(&MutatorState<T>) + Send + Sync + 'static) -> Subscription {
		let cb: Arc<dyn Fn(&MutatorState<T>) + Send + Sync> = Arc::new(cb);
		let sub = self.inner.add_listener(Arc::clone(&cb));
		cb(&self.get());
		sub
	}

	/// Runs the mutation with `arg`, resolving to its outcome.
	///
	/// With [`MutatorOptions::throttle_calls`] enabled, a call made while a mutation is in flight resolves to the
	/// in-flight outcome without invoking the mutation function again (`arg` is discarded).
	pub fn mutate(&self, arg: D) -> impl Future<Output = Result<Arc<T>, Error>> + Send + 'static {
		self.inner.mutate(arg)
	}
}

impl<D, T, R> MutatorInner<D, T, R>
where
	D: Send + 'static,
	T: Send + Sync + 'static,
	R: Runtime
{
	fn add_listener(&self, cb: Arc<dyn Fn(&MutatorState<T>) + Send + Sync>) -> Subscription {
		let (key, _) = self.listeners.add(cb);
		let weak = self.me.clone();
		Subscription::new(move || {
			if let Some(inner) = weak.upgrade() {
				if inner.listeners.remove(key) {
					// One-shot result surface: clear the result when the last subscriber leaves.
					*inner.state.write() = MutatorState::default();
				}
			}
		})
	}

	fn mutate(&self, arg: D) -> FlightWait<MutationOutcome<T>> {
		let (cell, start) = {
			let mut flight = self.flight.lock();
			match &*flight {
				Some(cell) if self.options.throttle_calls && !cell.is_settled() => (Arc::clone(cell), false),
				_ => {
					let cell = Arc::new(FlightCell::new());
					*flight = Some(Arc::clone(&cell));
					(cell, true)
				}
			}
		};
		if start {
			self.begin(arg, Arc::clone(&cell));
		}
		cell.wait()
	}

	fn begin(&self, arg: D, cell: Arc<FlightCell<MutationOutcome<T>>>) {
		let Some(me) = self.me.upgrade() else {
			return;
		};
		self.publish(MutatorState {
			loading: true,
			data: None,
			error: None
		});

		let queued = Arc::new(Mutex::new(Vec::new()));
		let context = MutationContext {
			data: arg,
			ctx: Arc::clone(&self.ctx),
			queued: Arc::clone(&queued)
		};
		let fut = (self.action)(context);
		drop(self.ctx.runtime.spawn(async move {
			let res = fut.await;
			let outcome = match res {
				Ok(value) => {
					let value = Arc::new(value);
					me.publish(MutatorState {
						loading: false,
						data: Some(Arc::clone(&value)),
						error: None
					});
					// Queued invalidations run only after a successful settle, confirming optimistic writes.
					let queued: Vec<KeySelector> = std::mem::take(&mut *queued.lock());
					for selector in &queued {
						me.ctx.invalidate_selector(selector);
					}
					Ok(value)
				}
				Err(err) => {
					let err = Error::Fetcher(Arc::from(err));
					me.publish(MutatorState {
						loading: false,
						data: None,
						error: Some(err.clone())
					});
					me.report_error(&err);
					// Queued invalidations are dropped, so optimistically written keys get no confirmation
					// refetch; clear their revalidating flag instead of leaving them loading forever.
					let queued: Vec<KeySelector> = std::mem::take(&mut *queued.lock());
					for selector in &queued {
						if let KeySelector::Exact(key) = selector {
							me.ctx.republish(key);
						}
					}
					Err(err)
				}
			};
			cell.settle(outcome);
		}));
	}

	fn report_error(&self, err: &Error) {
		let Error::Fetcher(shared) = err else {
			return;
		};
		let cb = self.options.on_error.clone().or_else(|| self.ctx.default_on_error());
		if let Some(cb) = cb {
			// Mutations have no canonical key.
			cb(shared, "");
		}
	}

	fn publish(&self, next: MutatorState<T>) {
		{
			let mut state = self.state.write();
			*state = next.clone();
		}
		self.listeners.notify(&next);
	}
}

/// The capabilities handed to a mutation function.
pub struct MutationContext<D, R: Runtime = DefaultRuntime> {
	/// The argument passed to [`MutatorStore::mutate`].
	pub data: D,
	ctx: Arc<NanoqueryInner<R>>,
	queued: Arc<Mutex<Vec<KeySelector>>>
}

impl<D, R: Runtime> MutationContext<D, R> {
	/// Queues keys for invalidation once the mutation settles successfully.
	pub fn invalidate(&self, selector: impl Into<KeySelector>) {
		self.queued.lock().push(selector.into());
	}

	/// Returns a cache updater for `key` along with the key's current data, if any.
	///
	/// Values written through the updater publish immediately to every active fetcher store on the key (optimistic
	/// update), and an invalidation of the key is queued to run after the mutation settles, so the optimistic value
	/// is confirmed by a refetch.
	pub fn get_cache_updater<V: Send + Sync + 'static>(&self, key: impl Into<Arc<str>>) -> (CacheUpdater<V, R>, Option<Arc<V>>) {
		self.updater(key.into(), true)
	}

	/// Like [`MutationContext::get_cache_updater`], but without the queued invalidation: the written value stands
	/// until otherwise overwritten.
	pub fn get_cache_updater_manual<V: Send + Sync + 'static>(&self, key: impl Into<Arc<str>>) -> (CacheUpdater<V, R>, Option<Arc<V>>) {
		self.updater(key.into(), false)
	}

	fn updater<V: Send + Sync + 'static>(&self, key: Arc<str>, auto_invalidate: bool) -> (CacheUpdater<V, R>, Option<Arc<V>>) {
		if auto_invalidate {
			self.queued.lock().push(KeySelector::Exact(Arc::clone(&key)));
		}
		let previous = self.ctx.cache.fresh(&key).and_then(|entry| entry.data_as::<V>()).and_then(Result::ok);
		(
			CacheUpdater {
				ctx: Arc::clone(&self.ctx),
				key,
				revalidating: auto_invalidate,
				_marker: PhantomData
			},
			previous
		)
	}
}

/// Writes optimistic values into one cache key. Obtained from [`MutationContext::get_cache_updater`].
pub struct CacheUpdater<V: Send + Sync + 'static, R: Runtime = DefaultRuntime> {
	ctx: Arc<NanoqueryInner<R>>,
	key: Arc<str>,
	revalidating: bool,
	_marker: PhantomData<fn(V)>
}

impl<V: Send + Sync + 'static, R: Runtime> CacheUpdater<V, R> {
	/// Writes `value` into the cache entry and publishes it to every active fetcher store on the key.
	pub fn set(&self, value: V) {
		self.ctx.write_cache(&self.key, Some(FetchPayload::new(value)), self.revalidating);
	}
}
