use std::{
	future::Future,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll, Waker}
};

use parking_lot::Mutex;
use slotmap::SlotMap;

// Use `tokio`'s `Instant` wrapper in testing since we can 'advance' time with `tokio::time::advance`
#[cfg(test)]
pub type Instant = tokio::time::Instant;
#[cfg(not(test))]
pub type Instant = std::time::Instant;

use crate::runtime::{Runtime, Task};

slotmap::new_key_type! {
	pub(crate) struct ListenerKey;
}

/// A set of subscriber callbacks observing values of type `T`.
///
/// Callbacks are invoked outside the registry lock so a listener may add or drop subscriptions from within its own
/// callback.
pub(crate) struct Listeners<T: ?Sized> {
	inner: Mutex<SlotMap<ListenerKey, Arc<dyn Fn(&T) + Send + Sync>>>
}

impl<T: ?Sized> Listeners<T> {
	pub fn new() -> Self {
		Listeners { inner: Mutex::new(SlotMap::with_key()) }
	}

	/// Registers a callback, returning its key and whether it is the first listener.
	pub fn add(&self, cb: Arc<dyn Fn(&T) + Send + Sync>) -> (ListenerKey, bool) {
		let mut inner = self.inner.lock();
		let first = inner.is_empty();
		(inner.insert(cb), first)
	}

	/// Removes a callback, returning `true` if no listeners remain.
	pub fn remove(&self, key: ListenerKey) -> bool {
		let mut inner = self.inner.lock();
		inner.remove(key);
		inner.is_empty()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}

	pub fn notify(&self, value: &T) {
		let snapshot: Vec<_> = self.inner.lock().values().cloned().collect();
		for cb in snapshot {
			cb(value);
		}
	}
}

/// Owns a fetcher store's single scheduled timer task: either its pending error retry or its interval revalidation
/// loop.
///
/// Arming the slot cancels whatever it previously held, so a store can never run two competing retries (or two
/// interval loops) for the same concern. Key changes, explicit revalidation and invalidation, and the last
/// unsubscribe cancel the slot outright.
pub(crate) struct TimerSlot<R: Runtime> {
	runtime: R,
	scheduled: Option<R::Task<()>>
}

impl<R: Runtime> TimerSlot<R> {
	pub fn new(runtime: R) -> Self {
		Self { runtime, scheduled: None }
	}

	/// Schedules `timer`, cancelling any previously scheduled task.
	pub fn arm<F>(&mut self, timer: F)
	where
		F: Future<Output = ()> + Send + 'static
	{
		self.cancel();
		self.scheduled = Some(self.runtime.spawn(timer));
	}

	/// Cancels the scheduled task, if any.
	pub fn cancel(&mut self) {
		if let Some(task) = self.scheduled.take() {
			task.abort();
		}
	}
}

/// A one-shot, multi-consumer settlement cell.
///
/// Callers obtain futures via [`FlightCell::wait`]; every waiter resolves with a clone of the settled value. Used to
/// share one in-flight mutation between throttled `mutate` calls without tying the crate to a particular runtime's
/// channel types.
pub(crate) struct FlightCell<T: Clone> {
	state: Mutex<FlightState<T>>
}

struct FlightState<T> {
	result: Option<T>,
	wakers: Vec<Waker>
}

impl<T: Clone> FlightCell<T> {
	pub fn new() -> Self {
		FlightCell {
			state: Mutex::new(FlightState { result: None, wakers: Vec::new() })
		}
	}

	pub fn is_settled(&self) -> bool {
		self.state.lock().result.is_some()
	}

	pub fn settle(&self, value: T) {
		let wakers = {
			let mut state = self.state.lock();
			if state.result.is_some() {
				return;
			}
			state.result = Some(value);
			std::mem::take(&mut state.wakers)
		};
		for waker in wakers {
			waker.wake();
		}
	}

	pub fn wait(self: &Arc<Self>) -> FlightWait<T> {
		FlightWait(Arc::clone(self))
	}
}

pub(crate) struct FlightWait<T: Clone>(Arc<FlightCell<T>>);

impl<T: Clone> Future for FlightWait<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
		let mut state = self.0.state.lock();
		if let Some(value) = &state.result {
			return Poll::Ready(value.clone());
		}
		if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
			state.wakers.push(cx.waker().clone());
		}
		Poll::Pending
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering}
	};

	use tokio::task::yield_now;

	use super::{FlightCell, Listeners};

	#[tokio::test]
	async fn flight_cell_shares_result() {
		let cell = Arc::new(FlightCell::new());
		let a = tokio::spawn({
			let cell = Arc::clone(&cell);
			async move { cell.wait().await }
		});
		let b = tokio::spawn({
			let cell = Arc::clone(&cell);
			async move { cell.wait().await }
		});

		yield_now().await;
		assert!(!cell.is_settled());
		cell.settle(42usize);

		assert_eq!(a.await.unwrap(), 42);
		assert_eq!(b.await.unwrap(), 42);
	}

	#[test]
	fn listeners_track_first_and_empty() {
		let listeners = Listeners::<usize>::new();
		let hits = Arc::new(AtomicUsize::new(0));

		let (a, first) = listeners.add({
			let hits = Arc::clone(&hits);
			Arc::new(move |v| {
				hits.fetch_add(*v, Ordering::Relaxed);
			})
		});
		assert!(first);
		let (b, first) = listeners.add(Arc::new(|_| {}));
		assert!(!first);

		listeners.notify(&3);
		assert_eq!(hits.load(Ordering::Relaxed), 3);

		assert!(!listeners.remove(b));
		assert!(listeners.remove(a));
	}
}
