use std::{future::Future, marker::PhantomData, time::Duration};

/// The stand-in default when zero (or several) runtime features are enabled. It has no values, so an instance can
/// only be built by choosing a runtime explicitly through [`nanoquery::new_in`][crate::new_in].
#[derive(Clone)]
pub enum NullRuntime {}

impl super::Runtime for NullRuntime {
	type Task<T: Send + 'static> = NullHandle<T>;

	fn spawn<F>(&self, _future: F) -> Self::Task<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static
	{
		unreachable!()
	}

	async fn wait(&self, _duration: Duration) {
		unreachable!()
	}

	async fn yield_now(&self) {
		unreachable!()
	}
}

pub struct NullHandle<T>(PhantomData<T>);

unsafe impl<T: Send> Send for NullHandle<T> {}
unsafe impl<T: Send> Sync for NullHandle<T> {}

impl<T: Send + 'static> super::Task<T> for NullHandle<T> {
	fn abort(self) {
		unreachable!()
	}
}
