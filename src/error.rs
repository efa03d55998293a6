use std::{any::TypeId, fmt, sync::Arc};

/// A shared, type-erased error produced by a user-supplied fetcher or mutation.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// A boxed error returned by user-supplied fetchers and mutations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Any error that can surface on a fetcher or mutator store.
#[derive(Clone)]
pub enum Error {
	/// The user-supplied fetcher or mutation rejected.
	Fetcher(SharedError),
	/// The type contained in the cache does not match the requested type.
	MismatchedType(MismatchedTypeError),
	/// A fetch was required, but neither the store nor the instance configured a fetcher.
	MissingFetcher
}

impl Error {
	/// Returns `true` if `other` describes the same error occurrence.
	///
	/// Fetcher errors compare by pointer identity so that republishing the same terminal result does not notify
	/// subscribers.
	pub(crate) fn same_as(&self, other: &Error) -> bool {
		match (self, other) {
			(Error::Fetcher(a), Error::Fetcher(b)) => Arc::ptr_eq(a, b),
			(Error::MismatchedType(a), Error::MismatchedType(b)) => a.contained_type == b.contained_type && a.wanted_type == b.wanted_type,
			(Error::MissingFetcher, Error::MissingFetcher) => true,
			_ => false
		}
	}
}

impl fmt::Debug for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Fetcher(e) => f.debug_tuple("Error::Fetcher").field(e).finish(),
			Self::MismatchedType(e) => f.debug_tuple("Error::MismatchedType").field(e).finish(),
			Self::MissingFetcher => f.write_str("Error::MissingFetcher")
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Fetcher(e) => {
				f.write_str("Failed to fetch: ")?;
				fmt::Display::fmt(e, f)
			}
			Self::MismatchedType(e) => fmt::Display::fmt(e, f),
			Self::MissingFetcher => f.write_str("No fetcher is configured for this store or instance")
		}
	}
}

impl std::error::Error for Error {}

/// An error caused when the type contained in the cache does not match the requested type.
///
/// This often occurs when two fetcher stores resolve to the same canonical key, but with different data types.
#[derive(Clone, Debug)]
pub struct MismatchedTypeError {
	/// The ID of the type contained in the cache.
	pub contained_type: TypeId,
	/// The ID of the type which was requested.
	pub wanted_type: TypeId,
	#[cfg(debug_assertions)]
	pub(crate) contained_type_name: Option<&'static str>,
	#[cfg(debug_assertions)]
	pub(crate) wanted_type_name: &'static str
}

impl MismatchedTypeError {
	/// Returns the name of the type contained in the cache, or `None` if nanoquery was not compiled with debug
	/// assertions (`--release`).
	#[inline]
	pub fn contained_type_name(&self) -> Option<&'static str> {
		#[cfg(debug_assertions)]
		return self.contained_type_name;
		#[cfg(not(debug_assertions))]
		None
	}

	/// Returns the name of the requested type, or `None` if nanoquery was not compiled with debug assertions
	/// (`--release`).
	#[inline]
	pub fn wanted_type_name(&self) -> Option<&'static str> {
		#[cfg(debug_assertions)]
		return Some(self.wanted_type_name);
		#[cfg(not(debug_assertions))]
		None
	}
}

impl fmt::Display for MismatchedTypeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Data type mismatch")?;
		#[cfg(debug_assertions)]
		{
			if let Some(contained) = self.contained_type_name {
				f.write_str(" - cache contains a value of type `")?;
				f.write_str(contained)?;
				f.write_str("`, but tried to retrieve a value of type `")?;
				f.write_str(self.wanted_type_name)?;
				f.write_str("`.")?;
			}
		}
		Ok(())
	}
}

impl std::error::Error for MismatchedTypeError {}
