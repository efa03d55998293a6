//! Provides the [`Signals`] trait connecting nanoquery to environment event sources.
//!
//! `Signals` supplies the three event sources revalidation can react to: a *visibility* signal gating interval
//! revalidation, a *focus* signal, and an *online* (reconnect) signal. In a browser-like host these map to
//! `visibilitychange`, `focus`, and `online` events; outside of one, [`NullSignals`] degrades to "always visible,
//! never reconnects", leaving interval timers and explicit invalidation as the only revalidation triggers.

use std::sync::Arc;

use parking_lot::Mutex;

/// Environment event sources consumed by revalidation.
///
/// Callbacks registered through `on_focus`/`on_reconnect` are installed lazily, on the first mount of a fetcher store
/// that enables the corresponding option, and may be retained for the lifetime of the nanoquery instance.
pub trait Signals: Send + Sync + 'static {
	/// Returns whether the host application is currently visible.
	///
	/// While this reports `false`, interval revalidation does not tick.
	fn visible(&self) -> bool {
		true
	}

	/// Registers a callback to run whenever the host application gains focus.
	fn on_focus(&self, _cb: Box<dyn Fn() + Send + Sync>) {}

	/// Registers a callback to run whenever the host regains network connectivity.
	fn on_reconnect(&self, _cb: Box<dyn Fn() + Send + Sync>) {}
}

/// The [`Signals`] implementation for hosts without focus or connectivity events.
///
/// Always visible; focus and reconnect callbacks are discarded and never fire.
#[derive(Clone, Copy, Default)]
pub struct NullSignals;

impl Signals for NullSignals {}

#[doc(hidden)]
mod manual {
	use super::*;

	pub struct ManualSignalsInner {
		pub visible: bool,
		pub focus: Vec<Arc<dyn Fn() + Send + Sync>>,
		pub reconnect: Vec<Arc<dyn Fn() + Send + Sync>>
	}

	impl Default for ManualSignalsInner {
		fn default() -> Self {
			ManualSignalsInner {
				visible: true,
				focus: Vec::new(),
				reconnect: Vec::new()
			}
		}
	}

	/// A hand-driven [`Signals`] source for tests and headless hosts.
	#[derive(Default, Clone)]
	pub struct ManualSignals(pub(super) Arc<Mutex<ManualSignalsInner>>);

	impl ManualSignals {
		pub fn new() -> Self {
			ManualSignals::default()
		}

		pub fn set_visible(&self, visible: bool) {
			self.0.lock().visible = visible;
		}

		/// Fires all registered focus callbacks.
		pub fn focus(&self) {
			let snapshot: Vec<_> = self.0.lock().focus.clone();
			for cb in snapshot {
				cb();
			}
		}

		/// Fires all registered reconnect callbacks.
		pub fn reconnect(&self) {
			let snapshot: Vec<_> = self.0.lock().reconnect.clone();
			for cb in snapshot {
				cb();
			}
		}
	}

	impl Signals for ManualSignals {
		fn visible(&self) -> bool {
			self.0.lock().visible
		}

		fn on_focus(&self, cb: Box<dyn Fn() + Send + Sync>) {
			self.0.lock().focus.push(Arc::from(cb));
		}

		fn on_reconnect(&self, cb: Box<dyn Fn() + Send + Sync>) {
			self.0.lock().reconnect.push(Arc::from(cb));
		}
	}
}

#[doc(hidden)]
pub use self::manual::ManualSignals;
