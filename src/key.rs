//! Composite key resolution.
//!
//! A fetcher store's identity is a sequence of [key parts][KeyPart]: fixed scalars, reactive [`Atom`]s, or other
//! fetcher stores. Resolution concatenates the parts' string forms, in order, with no separator into the *canonical
//! key*; if any part resolves to `None`, the whole key is disabled and the store publishes a neutral non-loading
//! state.

use std::{fmt, sync::Arc};

use crate::atom::{Atom, Subscription};

/// A value usable as (part of) a key part: anything with a stable string form, or `None` to disable the key.
pub trait KeyFragment {
	/// Returns the fragment's contribution to the canonical key, or `None` to disable it.
	fn fragment(&self) -> Option<String>;
}

impl KeyFragment for String {
	fn fragment(&self) -> Option<String> {
		Some(self.clone())
	}
}

impl KeyFragment for &str {
	fn fragment(&self) -> Option<String> {
		Some((*self).to_string())
	}
}

impl KeyFragment for Arc<str> {
	fn fragment(&self) -> Option<String> {
		Some(self.to_string())
	}
}

impl KeyFragment for bool {
	fn fragment(&self) -> Option<String> {
		Some(self.to_string())
	}
}

macro_rules! numeric_fragments {
	($($ty:ty),*) => {
		$(impl KeyFragment for $ty {
			fn fragment(&self) -> Option<String> {
				Some(self.to_string())
			}
		})*
	};
}
numeric_fragments!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl<F: KeyFragment> KeyFragment for Option<F> {
	fn fragment(&self) -> Option<String> {
		self.as_ref().and_then(KeyFragment::fragment)
	}
}

// Nested atoms resolve through their current value, so an atom-of-atom contributes the innermost fragment.
impl<F: KeyFragment + Clone + Send + Sync + 'static> KeyFragment for Atom<F> {
	fn fragment(&self) -> Option<String> {
		self.get().fragment()
	}
}

/// A reactive key part: resolvable to a fragment, and watchable for changes.
pub(crate) trait ReactivePart: Send + Sync {
	fn resolve(&self) -> Option<String>;
	fn watch(&self, cb: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<F: KeyFragment + Clone + Send + Sync + 'static> ReactivePart for Atom<F> {
	fn resolve(&self) -> Option<String> {
		self.fragment()
	}

	fn watch(&self, cb: Box<dyn Fn() + Send + Sync>) -> Subscription {
		self.listen(move |_| cb())
	}
}

/// The seam through which a fetcher store contributes to another store's key.
///
/// The contribution is the upstream store's *canonical key*, never its data; the upstream's loading state is
/// irrelevant to resolution. Watching additionally holds the upstream store active so its key keeps recomputing.
pub(crate) trait KeySource: Send + Sync {
	fn current_key(&self) -> Option<Arc<str>>;
	fn watch_key(&self, cb: Box<dyn Fn() + Send + Sync>) -> Subscription;
	fn hold_active(&self) -> Subscription;
}

/// One part of a composite key specification.
pub struct KeyPart(pub(crate) PartImpl);

pub(crate) enum PartImpl {
	Value(Option<String>),
	Reactive(Box<dyn ReactivePart>),
	Store(Arc<dyn KeySource>)
}

impl KeyPart {
	/// A fixed part that never changes; `None` disables the key.
	pub fn value(fragment: impl KeyFragment) -> Self {
		KeyPart(PartImpl::Value(fragment.fragment()))
	}

	pub(crate) fn resolve(&self) -> Option<String> {
		match &self.0 {
			PartImpl::Value(v) => v.clone(),
			PartImpl::Reactive(atom) => atom.resolve(),
			PartImpl::Store(store) => store.current_key().map(|key| key.to_string())
		}
	}

	/// Subscribes to changes of a reactive part. Fixed parts return `None`.
	pub(crate) fn watch(&self, cb: Box<dyn Fn() + Send + Sync>) -> Option<Subscription> {
		match &self.0 {
			PartImpl::Value(_) => None,
			PartImpl::Reactive(atom) => Some(atom.watch(cb)),
			PartImpl::Store(store) => Some(Subscription::merge(store.hold_active(), store.watch_key(cb)))
		}
	}
}

impl fmt::Debug for KeyPart {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.0 {
			PartImpl::Value(v) => f.debug_tuple("KeyPart::Value").field(v).finish(),
			PartImpl::Reactive(_) => f.write_str("KeyPart::Reactive"),
			PartImpl::Store(_) => f.write_str("KeyPart::Store")
		}
	}
}

/// Conversion into a single [`KeyPart`].
pub trait IntoKeyPart {
	/// Converts `self` into a key part.
	fn into_key_part(self) -> KeyPart;
}

impl IntoKeyPart for KeyPart {
	fn into_key_part(self) -> KeyPart {
		self
	}
}

macro_rules! scalar_key_parts {
	($($ty:ty),*) => {
		$(impl IntoKeyPart for $ty {
			fn into_key_part(self) -> KeyPart {
				KeyPart::value(self)
			}
		})*
	};
}
scalar_key_parts!(String, &str, Arc<str>, bool, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl<F: KeyFragment> IntoKeyPart for Option<F> {
	fn into_key_part(self) -> KeyPart {
		KeyPart(PartImpl::Value(self.fragment()))
	}
}

impl<F: KeyFragment + Clone + Send + Sync + 'static> IntoKeyPart for Atom<F> {
	fn into_key_part(self) -> KeyPart {
		KeyPart(PartImpl::Reactive(Box::new(self)))
	}
}

impl<F: KeyFragment + Clone + Send + Sync + 'static> IntoKeyPart for &Atom<F> {
	fn into_key_part(self) -> KeyPart {
		self.clone().into_key_part()
	}
}

/// Conversion into an ordered key specification.
pub trait IntoKeyParts {
	/// Converts `self` into the ordered sequence of key parts.
	fn into_key_parts(self) -> Vec<KeyPart>;
}

impl<P: IntoKeyPart> IntoKeyParts for P {
	fn into_key_parts(self) -> Vec<KeyPart> {
		vec![self.into_key_part()]
	}
}

impl IntoKeyParts for Vec<KeyPart> {
	fn into_key_parts(self) -> Vec<KeyPart> {
		self
	}
}

macro_rules! tuple_key_parts {
	($($name:ident),+) => {
		impl<$($name: IntoKeyPart),+> IntoKeyParts for ($($name,)+) {
			#[allow(non_snake_case)]
			fn into_key_parts(self) -> Vec<KeyPart> {
				let ($($name,)+) = self;
				vec![$($name.into_key_part()),+]
			}
		}
	};
}
tuple_key_parts!(P1);
tuple_key_parts!(P1, P2);
tuple_key_parts!(P1, P2, P3);
tuple_key_parts!(P1, P2, P3, P4);
tuple_key_parts!(P1, P2, P3, P4, P5);
tuple_key_parts!(P1, P2, P3, P4, P5, P6);
tuple_key_parts!(P1, P2, P3, P4, P5, P6, P7);
tuple_key_parts!(P1, P2, P3, P4, P5, P6, P7, P8);

/// A fully resolved canonical key along with the resolved string form of each part.
#[derive(Clone)]
pub(crate) struct ResolvedKey {
	pub key: Arc<str>,
	pub parts: Vec<Arc<str>>
}

/// Resolves a key specification, or returns `None` if any part disables it.
pub(crate) fn resolve_parts(parts: &[KeyPart]) -> Option<ResolvedKey> {
	let mut joined = String::new();
	let mut resolved = Vec::with_capacity(parts.len());
	for part in parts {
		let fragment = part.resolve()?;
		joined.push_str(&fragment);
		resolved.push(Arc::<str>::from(fragment));
	}
	Some(ResolvedKey {
		key: Arc::from(joined),
		parts: resolved
	})
}

/// Selects cache keys for invalidation or cache mutation: an exact key, a list of keys, or a predicate.
#[derive(Clone)]
pub enum KeySelector {
	/// Matches exactly one canonical key.
	Exact(Arc<str>),
	/// Matches each listed canonical key.
	List(Vec<Arc<str>>),
	/// Matches every canonical key the predicate accepts.
	Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>)
}

impl KeySelector {
	/// Creates a predicate selector.
	pub fn matching(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
		KeySelector::Predicate(Arc::new(predicate))
	}

	pub(crate) fn matches(&self, key: &str) -> bool {
		match self {
			KeySelector::Exact(k) => &**k == key,
			KeySelector::List(keys) => keys.iter().any(|k| &**k == key),
			KeySelector::Predicate(predicate) => predicate(key)
		}
	}
}

impl fmt::Debug for KeySelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeySelector::Exact(k) => f.debug_tuple("KeySelector::Exact").field(k).finish(),
			KeySelector::List(keys) => f.debug_tuple("KeySelector::List").field(keys).finish(),
			KeySelector::Predicate(_) => f.write_str("KeySelector::Predicate")
		}
	}
}

impl From<&str> for KeySelector {
	fn from(key: &str) -> Self {
		KeySelector::Exact(Arc::from(key))
	}
}

impl From<String> for KeySelector {
	fn from(key: String) -> Self {
		KeySelector::Exact(Arc::from(key))
	}
}

impl From<Arc<str>> for KeySelector {
	fn from(key: Arc<str>) -> Self {
		KeySelector::Exact(key)
	}
}

impl From<Vec<&str>> for KeySelector {
	fn from(keys: Vec<&str>) -> Self {
		KeySelector::List(keys.into_iter().map(Arc::from).collect())
	}
}

impl From<Vec<String>> for KeySelector {
	fn from(keys: Vec<String>) -> Self {
		KeySelector::List(keys.into_iter().map(Arc::from).collect())
	}
}

impl From<&[&str]> for KeySelector {
	fn from(keys: &[&str]) -> Self {
		KeySelector::List(keys.iter().map(|k| Arc::from(*k)).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::{IntoKeyParts, KeySelector, resolve_parts};
	use crate::atom::Atom;

	#[test]
	fn scalars_concatenate_without_separator() {
		let parts = ("/api", "/todos/", 42u32).into_key_parts();
		let resolved = resolve_parts(&parts).unwrap();
		assert_eq!(&*resolved.key, "/api/todos/42");
		assert_eq!(resolved.parts.len(), 3);
		assert_eq!(&*resolved.parts[2], "42");
	}

	#[test]
	fn none_disables_the_key() {
		let parts = ("/api", Option::<String>::None).into_key_parts();
		assert!(resolve_parts(&parts).is_none());
	}

	#[test]
	fn atoms_resolve_to_their_current_value() {
		let id = Atom::new(Some("7".to_string()));
		let parts = ("/todos/", &id).into_key_parts();
		assert_eq!(&*resolve_parts(&parts).unwrap().key, "/todos/7");

		id.set(None);
		assert!(resolve_parts(&parts).is_none());
	}

	#[test]
	fn nested_atoms_resolve_recursively() {
		let inner = Atom::new("deep".to_string());
		let outer = Atom::new(inner);
		let parts = ("/x/", &outer).into_key_parts();
		assert_eq!(&*resolve_parts(&parts).unwrap().key, "/x/deep");
	}

	#[test]
	fn selectors_match() {
		assert!(KeySelector::from("/a").matches("/a"));
		assert!(!KeySelector::from("/a").matches("/ab"));
		assert!(KeySelector::from(vec!["/a", "/b"]).matches("/b"));
		assert!(KeySelector::matching(|k| k.starts_with("/api")).matches("/api/x"));
	}
}
