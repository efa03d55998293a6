//! A minimal reactive store primitive.
//!
//! [`Atom`] is the write/subscribe/read surface that key specifications consume: a single value with change
//! notification. It exists so that reactive key parts have a concrete seam; any richer reactive system can feed an
//! `Atom` from its own change events.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::util::Listeners;

/// A subscription to a reactive store.
///
/// Dropping the subscription detaches the listener; when the last listener of a fetcher or mutator store detaches, the
/// store deactivates.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
	pub(crate) fn new(unlisten: impl FnOnce() + Send + 'static) -> Self {
		Subscription(Some(Box::new(unlisten)))
	}

	/// Combines two subscriptions into one that detaches both when dropped.
	pub(crate) fn merge(a: Subscription, b: Subscription) -> Subscription {
		Subscription::new(move || {
			drop(a);
			drop(b);
		})
	}

	/// Explicitly detaches the listener. Equivalent to dropping the subscription.
	pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(unlisten) = self.0.take() {
			unlisten();
		}
	}
}

/// A writable reactive value.
///
/// `Atom` is cheaply cloneable; clones share the same value and listener set.
pub struct Atom<T> {
	inner: Arc<AtomInner<T>>
}

struct AtomInner<T> {
	value: RwLock<T>,
	listeners: Listeners<T>
}

impl<T> Clone for Atom<T> {
	fn clone(&self) -> Self {
		Atom { inner: Arc::clone(&self.inner) }
	}
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Atom<T> {
	fn default() -> Self {
		Atom::new(T::default())
	}
}

impl<T: Clone + Send + Sync + 'static> Atom<T> {
	/// Creates an atom holding `value`.
	pub fn new(value: T) -> Self {
		Atom {
			inner: Arc::new(AtomInner {
				value: RwLock::new(value),
				listeners: Listeners::new()
			})
		}
	}

	/// Returns a clone of the current value.
	pub fn get(&self) -> T {
		self.inner.value.read().clone()
	}

	/// Replaces the current value and notifies listeners.
	pub fn set(&self, value: T) {
		{
			let mut slot = self.inner.value.write();
			*slot = value.clone();
		}
		self.inner.listeners.notify(&value);
	}

	/// Registers a listener invoked on every [`Atom::set`].
	pub fn listen(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
		let (key, _) = self.inner.listeners.add(Arc::new(cb));
		let weak: Weak<AtomInner<T>> = Arc::downgrade(&self.inner);
		Subscription::new(move || {
			if let Some(inner) = weak.upgrade() {
				inner.listeners.remove(key);
			}
		})
	}

	/// Registers a listener and immediately invokes it with the current value.
	pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
		let current = self.get();
		cb(&current);
		self.listen(cb)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering}
	};

	use super::Atom;

	#[test]
	fn listen_and_drop() {
		let atom = Atom::new(1usize);
		let seen = Arc::new(AtomicUsize::new(0));

		let sub = atom.listen({
			let seen = Arc::clone(&seen);
			move |v| {
				seen.store(*v, Ordering::Relaxed);
			}
		});

		atom.set(5);
		assert_eq!(seen.load(Ordering::Relaxed), 5);
		assert_eq!(atom.get(), 5);

		drop(sub);
		atom.set(9);
		assert_eq!(seen.load(Ordering::Relaxed), 5);
	}

	#[test]
	fn subscribe_fires_immediately() {
		let atom = Atom::new("a".to_string());
		let hits = Arc::new(AtomicUsize::new(0));

		let _sub = atom.subscribe({
			let hits = Arc::clone(&hits);
			move |_| {
				hits.fetch_add(1, Ordering::Relaxed);
			}
		});

		assert_eq!(hits.load(Ordering::Relaxed), 1);
		atom.set("b".to_string());
		assert_eq!(hits.load(Ordering::Relaxed), 2);
	}
}
