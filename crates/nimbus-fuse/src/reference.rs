//! Explicitly counted references and construction capabilities.
//!
//! A [`Ref`] is a handle to an object owned by a registry. Unlike an `Arc`,
//! every `Ref` created, cloned or dropped is reported to the object through
//! [`Referenced`], so the registry can see when the last outside reference
//! goes away and decide whether to keep, cache or destroy the object.
//!
//! A [`Badge`] is a zero-sized token that only the owning registry can
//! mint. Constructors that must not be called from anywhere else take one
//! by value.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// An object whose references are counted explicitly.
pub trait Referenced: Send + Sync {
    /// A reference was created.
    fn do_ref(&self);

    /// A reference was released.
    fn do_unref(&self);
}

/// A counted reference to a `T`.
pub struct Ref<T: Referenced> {
    inner: Arc<T>,
}

impl<T: Referenced> Ref<T> {
    /// Creates a new reference to `inner`.
    ///
    /// Only the registry owning `inner` creates references from scratch;
    /// everyone else clones an existing one.
    pub(crate) fn new(inner: Arc<T>) -> Self {
        inner.do_ref();
        Self { inner }
    }

    /// Whether both references name the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    pub(crate) fn is(&self, other: &Arc<T>) -> bool {
        Arc::ptr_eq(&self.inner, other)
    }
}

impl<T: Referenced> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.inner))
    }
}

impl<T: Referenced> Drop for Ref<T> {
    fn drop(&mut self) {
        self.inner.do_unref();
    }
}

impl<T: Referenced> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Referenced + fmt::Debug> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.inner).finish()
    }
}

/// A type that mints [`Badge`]s for itself.
pub(crate) trait Issuer {
    /// Constructible only inside the issuer's module.
    type Key;
}

/// Proof that the caller is `T`.
pub struct Badge<T> {
    _owner: PhantomData<fn() -> T>,
}

impl<T: Issuer> Badge<T> {
    pub(crate) fn new(_: T::Key) -> Self {
        Self {
            _owner: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Badge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Badge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counted {
        references: AtomicI64,
        released: AtomicUsize,
    }

    impl Referenced for Counted {
        fn do_ref(&self) {
            self.references.fetch_add(1, Ordering::SeqCst);
        }

        fn do_unref(&self) {
            if self.references.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_clone_and_drop_are_counted() {
        let object = Arc::new(Counted::default());
        let first = Ref::new(Arc::clone(&object));
        let second = first.clone();
        assert_eq!(object.references.load(Ordering::SeqCst), 2);
        assert!(Ref::ptr_eq(&first, &second));

        drop(first);
        assert_eq!(object.released.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(object.references.load(Ordering::SeqCst), 0);
        assert_eq!(object.released.load(Ordering::SeqCst), 1);
    }

    mod registry {
        use super::super::{Badge, Issuer};

        pub struct Registry;

        pub struct Key(());

        impl Issuer for Registry {
            type Key = Key;
        }

        impl Registry {
            pub fn badge(&self) -> Badge<Registry> {
                Badge::new(Key(()))
            }
        }
    }

    fn requires_registry(_: Badge<registry::Registry>) -> &'static str {
        "issued"
    }

    #[test]
    fn test_badges_are_minted_by_their_issuer() {
        // Outside `registry`, the only way to a badge is through the issuer.
        let badge = registry::Registry.badge();
        assert_eq!(requires_registry(badge), "issued");
        assert_eq!(std::mem::size_of::<Badge<registry::Registry>>(), 0);
    }

    #[test]
    fn test_zero_transitions_are_reported_each_time() {
        let object = Arc::new(Counted::default());
        drop(Ref::new(Arc::clone(&object)));
        drop(Ref::new(Arc::clone(&object)));
        assert_eq!(object.released.load(Ordering::SeqCst), 2);
    }
}
