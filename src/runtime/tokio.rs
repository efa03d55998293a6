use std::{future::Future, time::Duration};

use tokio::{runtime::Handle, task::JoinHandle};

/// Spawns nanoquery's background tasks on the [`tokio`] runtime the caller is already inside of.
#[derive(Clone, Default)]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub struct Tokio;

impl super::Runtime for Tokio {
	type Task<T: Send + 'static> = JoinHandle<T>;

	fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static
	{
		tokio::spawn(future)
	}

	fn wait(&self, duration: Duration) -> impl Future<Output = ()> {
		tokio::time::sleep(duration)
	}

	fn yield_now(&self) -> impl Future<Output = ()> {
		tokio::task::yield_now()
	}
}

/// Spawns nanoquery's background tasks on the [`tokio`] runtime behind a [`Handle`], for callers that sit outside
/// of it.
#[derive(Clone)]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub struct TokioHandle(Handle);

impl TokioHandle {
	/// Wraps a `tokio` runtime [`Handle`].
	pub fn new(handle: Handle) -> Self {
		TokioHandle(handle)
	}
}

impl super::Runtime for TokioHandle {
	type Task<T: Send + 'static> = JoinHandle<T>;

	fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static
	{
		self.0.spawn(future)
	}

	fn wait(&self, duration: Duration) -> impl Future<Output = ()> {
		let _guard = self.0.enter();
		tokio::time::sleep(duration)
	}

	fn yield_now(&self) -> impl Future<Output = ()> {
		tokio::task::yield_now()
	}
}

impl<T: Send + 'static> super::Task<T> for JoinHandle<T> {
	fn abort(self) {
		JoinHandle::<T>::abort(&self);
	}
}
