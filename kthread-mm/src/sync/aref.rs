//! Owned handles on objects that carry their own reference count.
//!
//! [`MmStruct`](crate::MmStruct) keeps `mm_count` inside the object, the way
//! the rest of the kernel expects to grab and drop it. [`ARef<T>`] behaves like
//! `Arc<T>` but increments and decrements that embedded count instead of a
//! separate allocation header.

use core::{marker::PhantomData, ops::Deref, ptr::NonNull};

/// Types that are always reference counted.
///
/// # Safety
///
/// Implementers must ensure that an increment keeps the object alive at least
/// until the matching decrement, and that every instance is reference counted.
pub unsafe trait AlwaysRefCounted {
    /// Increments the reference count on the object.
    fn inc_ref(&self);

    /// Decrements the reference count on the object.
    ///
    /// Frees the object when the count reaches zero.
    ///
    /// # Safety
    ///
    /// Callers must own an increment that they give up here, and must not use
    /// the object afterwards unless they own another increment.
    unsafe fn dec_ref(obj: NonNull<Self>);
}

/// An owned reference to an always-reference-counted object.
///
/// # Invariants
///
/// `ptr` is valid for the lifetime of the `ARef`, which owns one increment of
/// the underlying count.
pub struct ARef<T: AlwaysRefCounted> {
    ptr: NonNull<T>,
    _p: PhantomData<T>,
}

// SAFETY: an `ARef<T>` only hands out `&T`, and the last one dropped may free
// `T` on whatever thread it is dropped on.
unsafe impl<T: AlwaysRefCounted + Sync + Send> Send for ARef<T> {}

// SAFETY: sharing `&ARef<T>` lets other threads clone it, see `Send` above.
unsafe impl<T: AlwaysRefCounted + Sync + Send> Sync for ARef<T> {}

impl<T: AlwaysRefCounted> ARef<T> {
    /// Takes over one increment of the count on `ptr`.
    ///
    /// # Safety
    ///
    /// The count must have been incremented for this `ARef`, and the caller
    /// must not release that increment itself.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _p: PhantomData,
        }
    }

    /// Whether two handles point at the same object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Whether this handle points at `obj`.
    pub fn is(this: &Self, obj: &T) -> bool {
        core::ptr::eq(this.ptr.as_ptr(), obj)
    }
}

impl<T: AlwaysRefCounted> Clone for ARef<T> {
    fn clone(&self) -> Self {
        self.inc_ref();
        // SAFETY: we just took the increment this handle owns.
        unsafe { Self::from_raw(self.ptr) }
    }
}

impl<T: AlwaysRefCounted> Deref for ARef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the type invariants keep the object alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: AlwaysRefCounted> From<&T> for ARef<T> {
    fn from(b: &T) -> Self {
        b.inc_ref();
        // SAFETY: we just took the increment this handle owns.
        unsafe { Self::from_raw(NonNull::from(b)) }
    }
}

impl<T: AlwaysRefCounted> Drop for ARef<T> {
    fn drop(&mut self) {
        // SAFETY: this handle owns the increment being released.
        unsafe { T::dec_ref(self.ptr) };
    }
}
