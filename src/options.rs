use std::{sync::Arc, time::Duration};

use crate::{
	cache::CacheSeed,
	error::SharedError,
	fetcher::ErasedFetcher
};

/// Callback invoked on every fetch or mutation failure. Receives the error and the canonical key (empty for
/// mutations, which have no key).
pub type ErrorCallback = Arc<dyn Fn(&SharedError, &str) + Send + Sync>;

/// Retry policy consulted after each consecutive fetch failure. Returning `None` (or a zero delay) stops retrying.
pub type RetryPolicy = Arc<dyn Fn(&RetryEvent) -> Option<Duration> + Send + Sync>;

/// The context handed to a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryEvent {
	/// How many consecutive failures this key has seen, starting at 1. Reset to 0 by any success.
	pub retry_count: u32,
	/// The error produced by the most recent attempt.
	pub error: SharedError,
	/// The canonical key being retried.
	pub key: Arc<str>
}

/// Instance-wide options, supplied to [`nanoquery::new`][crate::new].
///
/// Every field has a working default; per-store [`OptionsPatch`]es override these, and
/// [`Nanoquery::overrule_settings`][crate::Nanoquery::overrule_settings] overrides both.
pub struct Options {
	/// Default fetch function used by stores created without their own.
	pub fetcher: Option<ErasedFetcher>,
	/// Entries to pre-seed the cache with (e.g. data carried over from server rendering).
	pub cache: Vec<(String, CacheSeed)>,
	/// Minimum wall-clock interval between fetcher invocations for the same key.
	pub dedupe_time: Duration,
	/// How long a cached entry remains eligible for display as stale data.
	pub cache_lifetime: Duration,
	/// Interval at which active stores revalidate. [`Duration::ZERO`] disables interval revalidation.
	pub revalidate_interval: Duration,
	/// Whether active stores revalidate when the host application gains focus.
	pub revalidate_on_focus: bool,
	/// Whether active stores revalidate when the host regains network connectivity.
	pub revalidate_on_reconnect: bool,
	/// Invoked on every fetch failure. A store-level callback fully supersedes this one.
	pub on_error: Option<ErrorCallback>,
	/// Retry policy for failed fetches. No policy means no retries.
	pub on_error_retry: Option<RetryPolicy>
}

impl Default for Options {
	fn default() -> Self {
		Options {
			fetcher: None,
			cache: Vec::new(),
			dedupe_time: Duration::from_secs(4),
			cache_lifetime: Duration::from_secs(8),
			revalidate_interval: Duration::ZERO,
			revalidate_on_focus: false,
			revalidate_on_reconnect: false,
			on_error: None,
			on_error_retry: None
		}
	}
}

/// A partial overlay over [`Options`], used for per-store overrides and the test-only settings overrule.
///
/// `None` fields inherit the layer below.
#[derive(Clone, Default)]
pub struct OptionsPatch {
	/// Overrides [`Options::fetcher`].
	pub fetcher: Option<ErasedFetcher>,
	/// Overrides [`Options::dedupe_time`].
	pub dedupe_time: Option<Duration>,
	/// Overrides [`Options::cache_lifetime`].
	pub cache_lifetime: Option<Duration>,
	/// Overrides [`Options::revalidate_interval`].
	pub revalidate_interval: Option<Duration>,
	/// Overrides [`Options::revalidate_on_focus`].
	pub revalidate_on_focus: Option<bool>,
	/// Overrides [`Options::revalidate_on_reconnect`].
	pub revalidate_on_reconnect: Option<bool>,
	/// Overrides [`Options::on_error`].
	pub on_error: Option<ErrorCallback>,
	/// Overrides [`Options::on_error_retry`].
	pub on_error_retry: Option<RetryPolicy>
}

/// The options in force for one engine decision: global defaults, overlaid with the store's patch, overlaid with the
/// overrule patch.
#[derive(Clone)]
pub(crate) struct ResolvedOptions {
	pub fetcher: Option<ErasedFetcher>,
	pub dedupe_time: Duration,
	pub cache_lifetime: Duration,
	pub revalidate_interval: Duration,
	pub revalidate_on_focus: bool,
	pub revalidate_on_reconnect: bool,
	pub on_error: Option<ErrorCallback>,
	pub on_error_retry: Option<RetryPolicy>
}

impl ResolvedOptions {
	pub fn layer(defaults: &Options, store: &OptionsPatch, overrule: &OptionsPatch) -> Self {
		let mut resolved = ResolvedOptions {
			fetcher: defaults.fetcher.clone(),
			dedupe_time: defaults.dedupe_time,
			cache_lifetime: defaults.cache_lifetime,
			revalidate_interval: defaults.revalidate_interval,
			revalidate_on_focus: defaults.revalidate_on_focus,
			revalidate_on_reconnect: defaults.revalidate_on_reconnect,
			on_error: defaults.on_error.clone(),
			on_error_retry: defaults.on_error_retry.clone()
		};
		resolved.apply(store);
		resolved.apply(overrule);
		resolved
	}

	fn apply(&mut self, patch: &OptionsPatch) {
		if let Some(fetcher) = &patch.fetcher {
			self.fetcher = Some(Arc::clone(fetcher));
		}
		if let Some(dedupe_time) = patch.dedupe_time {
			self.dedupe_time = dedupe_time;
		}
		if let Some(cache_lifetime) = patch.cache_lifetime {
			self.cache_lifetime = cache_lifetime;
		}
		if let Some(revalidate_interval) = patch.revalidate_interval {
			self.revalidate_interval = revalidate_interval;
		}
		if let Some(revalidate_on_focus) = patch.revalidate_on_focus {
			self.revalidate_on_focus = revalidate_on_focus;
		}
		if let Some(revalidate_on_reconnect) = patch.revalidate_on_reconnect {
			self.revalidate_on_reconnect = revalidate_on_reconnect;
		}
		if let Some(on_error) = &patch.on_error {
			self.on_error = Some(Arc::clone(on_error));
		}
		if let Some(on_error_retry) = &patch.on_error_retry {
			self.on_error_retry = Some(Arc::clone(on_error_retry));
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::{Options, OptionsPatch, ResolvedOptions};

	#[test]
	fn patches_layer_in_order() {
		let defaults = Options::default();
		let store = OptionsPatch {
			dedupe_time: Some(Duration::from_millis(100)),
			revalidate_on_focus: Some(true),
			..OptionsPatch::default()
		};
		let overrule = OptionsPatch {
			dedupe_time: Some(Duration::ZERO),
			..OptionsPatch::default()
		};

		let resolved = ResolvedOptions::layer(&defaults, &store, &overrule);
		assert_eq!(resolved.dedupe_time, Duration::ZERO);
		assert!(resolved.revalidate_on_focus);
		assert_eq!(resolved.cache_lifetime, defaults.cache_lifetime);
	}
}
