//! Connects nanoquery to an async executor.
//!
//! Fetches and revalidation timers run as spawned background tasks; the [`Runtime`] trait is the minimal executor
//! surface those tasks need. Implementations are provided for [`tokio`] and [`smol`] behind the Cargo features of
//! the same names.

use std::{future::Future, time::Duration};

mod null;
#[cfg(feature = "smol")]
mod smol;
#[cfg(feature = "smol")]
#[cfg_attr(docsrs, doc(cfg(feature = "smol")))]
pub use self::smol::Smol;
#[cfg(feature = "tokio")]
mod tokio;
#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub use self::tokio::{Tokio, TokioHandle};

cfg_if::cfg_if! {
	if #[cfg(all(feature = "tokio", not(feature = "smol")))] {
		#[doc(hidden)]
		pub type DefaultRuntime = self::tokio::Tokio;
	} else if #[cfg(all(feature = "smol", not(feature = "tokio")))] {
		#[doc(hidden)]
		pub type DefaultRuntime = self::smol::Smol;
	} else {
		#[doc(hidden)]
		pub type DefaultRuntime = self::null::NullRuntime;
	}
}

/// The executor surface a nanoquery instance schedules its background work on.
///
/// The crate ships two implementations:
/// - [`Tokio`] and [`TokioHandle`], behind the `tokio` feature (enabled by default)
/// - [`Smol`], behind the `smol` feature
///
/// When exactly one runtime feature is enabled, [`nanoquery::new`](crate::new) selects it as the default. Otherwise
/// the choice is ambiguous and the runtime must be passed explicitly through
/// [`nanoquery::new_in`](crate::new_in); the same applies when bringing a custom implementation of this trait.
pub trait Runtime: Clone + Send + Sync + 'static {
	/// The cancellable handle returned by [`Runtime::spawn`].
	type Task<T: Send + 'static>: Task<T>;

	/// Starts `future` as a detached background task and returns its handle.
	fn spawn<F>(&self, future: F) -> Self::Task<F::Output>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static;

	/// Sleeps for `duration` without blocking the executor. Retry backoff and interval revalidation are built on
	/// this.
	fn wait(&self, duration: Duration) -> impl Future<Output = ()> + Send;

	/// Returns a future that completes on the runtime's next cooperative tick.
	///
	/// The key resolver uses this as its coalescing boundary: multiple reactive key parts written before the tick
	/// produce a single key recomputation (and thus at most one fetch).
	fn yield_now(&self) -> impl Future<Output = ()> + Send;
}

/// Implemented for every [`Runtime`] that can also be constructed with [`Default`]; carries a diagnostic explaining
/// the feature matrix when no such runtime exists.
#[diagnostic::on_unimplemented(
	message = "the runtime `{Self}` has no default constructor",
	note = "construct it yourself and pass it to `nanoquery::new_in`",
	note = "seeing `NullRuntime` here means no default runtime is available; enable exactly one of the `tokio` or `smol` Cargo features, or supply your own `Runtime`"
)]
#[doc(hidden)]
pub trait RuntimeDefault: Runtime + Default {}
impl<T: Runtime + Default> RuntimeDefault for T {}

/// A handle to a task spawned on a [`Runtime`].
///
/// Retry and interval timers are cancelled through this handle when their preconditions lapse, such as a key change
/// or the last subscriber leaving. Dropping the handle must leave the task running: settle tasks are detached at
/// spawn, and their results still have to reach the cache.
pub trait Task<T>: Send + Sync + 'static {
	/// Requests cancellation of the task.
	fn abort(self);
}
