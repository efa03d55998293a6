use std::{
	any::{Any, TypeId},
	collections::HashMap,
	sync::Arc,
	time::Duration
};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use crate::{
	error::{MismatchedTypeError, SharedError},
	util::Instant
};

/// A type-erased successful fetch or mutation value, ready to be written into the cache.
#[derive(Clone)]
pub struct FetchPayload {
	pub(crate) value: Arc<dyn Any + Send + Sync>,
	#[cfg(debug_assertions)]
	pub(crate) type_name: &'static str
}

impl FetchPayload {
	/// Wraps `value` for cache storage.
	pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
		FetchPayload::from_arc(Arc::new(value))
	}

	/// Wraps an already-shared `value` for cache storage.
	pub fn from_arc<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
		FetchPayload {
			value,
			#[cfg(debug_assertions)]
			type_name: std::any::type_name::<T>()
		}
	}
}

/// A pre-seeded cache entry, supplied via [`Options::cache`][crate::Options::cache].
///
/// Seeds are consulted exactly like engine-written entries. `age` shifts the entry's `created` timestamp into the
/// past, so an aged seed can land outside the dedupe window (or past the cache lifetime entirely).
pub struct CacheSeed {
	outcome: SeedOutcome,
	age: Duration
}

enum SeedOutcome {
	Data(FetchPayload),
	Error(SharedError)
}

impl CacheSeed {
	/// Seeds a successful value.
	pub fn data<T: Send + Sync + 'static>(value: T) -> Self {
		CacheSeed {
			outcome: SeedOutcome::Data(FetchPayload::new(value)),
			age: Duration::ZERO
		}
	}

	/// Seeds an error outcome.
	pub fn error<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
		CacheSeed {
			outcome: SeedOutcome::Error(Arc::new(error)),
			age: Duration::ZERO
		}
	}

	/// Backdates the seed by `age`.
	pub fn aged(mut self, age: Duration) -> Self {
		self.age = age;
		self
	}

	pub(crate) fn into_entry(self, lifetime: Duration) -> CacheEntry {
		let now = Instant::now();
		let created = now.checked_sub(self.age).unwrap_or(now);
		match self.outcome {
			SeedOutcome::Data(payload) => CacheEntry::with_data(payload, created, lifetime),
			SeedOutcome::Error(error) => CacheEntry::with_error(error, created, lifetime)
		}
	}
}

/// A cache entry: the terminal outcome of the most recent fetch (or cache mutation) for one canonical key.
///
/// An entry holds either a `data` snapshot or an `error`; a later success erases the prior error and vice versa.
/// Entries are written only on terminal outcomes, never on loading transitions.
#[derive(Clone)]
pub(crate) struct CacheEntry {
	pub data: Option<Arc<dyn Any + Send + Sync>>,
	pub error: Option<SharedError>,
	pub created: Instant,
	pub expires: Instant,
	#[cfg(debug_assertions)]
	pub type_name: Option<&'static str>
}

impl CacheEntry {
	pub fn with_data(payload: FetchPayload, created: Instant, lifetime: Duration) -> Self {
		CacheEntry {
			data: Some(payload.value),
			error: None,
			created,
			expires: created + lifetime,
			#[cfg(debug_assertions)]
			type_name: Some(payload.type_name)
		}
	}

	pub fn with_error(error: SharedError, created: Instant, lifetime: Duration) -> Self {
		CacheEntry {
			data: None,
			error: Some(error),
			created,
			expires: created + lifetime,
			#[cfg(debug_assertions)]
			type_name: None
		}
	}

	/// Downcasts the entry's data to `T`, if data is present.
	pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Result<Arc<T>, MismatchedTypeError>> {
		let data = self.data.as_ref()?;
		Some(match Arc::downcast::<T>(Arc::clone(data)) {
			Ok(x) => Ok(x),
			Err(_) => Err(MismatchedTypeError {
				contained_type: (**data).type_id(),
				wanted_type: TypeId::of::<T>(),

				#[cfg(debug_assertions)]
				contained_type_name: self.type_name,
				#[cfg(debug_assertions)]
				wanted_type_name: std::any::type_name::<T>()
			})
		})
	}
}

/// The per-instance mapping from canonical key to [`CacheEntry`].
///
/// Replacement is purely time-based: an entry whose `expires` has passed is treated as absent and evicted on the next
/// access. There is no count-based eviction.
pub(crate) struct CacheStore {
	entries: RwLock<HashMap<Arc<str>, CacheEntry>>
}

impl CacheStore {
	pub fn new() -> Self {
		CacheStore { entries: RwLock::new(HashMap::new()) }
	}

	/// Returns the entry for `key` if it exists and has not expired. Expired entries are evicted.
	pub fn fresh(&self, key: &str) -> Option<CacheEntry> {
		let entries = self.entries.upgradable_read();
		let entry = entries.get(key)?.clone();
		if Instant::now() >= entry.expires {
			let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
			entries.remove(key);
			return None;
		}
		Some(entry)
	}

	pub fn set(&self, key: Arc<str>, entry: CacheEntry) {
		self.entries.write().insert(key, entry);
	}

	pub fn delete(&self, key: &str) {
		self.entries.write().remove(key);
	}

	pub fn keys(&self) -> Vec<Arc<str>> {
		self.entries.read().keys().cloned().collect()
	}

	/// Returns the keys of all live entries matching `predicate`.
	///
	/// The predicate runs on a snapshot of the key set, outside the cache lock.
	pub fn scan(&self, predicate: impl Fn(&str) -> bool) -> Vec<Arc<str>> {
		self.keys().into_iter().filter(|key| predicate(key)).collect()
	}
}
