use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::Float;

// Storage — Shared, growable flat element buffer
//
// One Storage backs any number of tensor views: cloning a Storage is just an
// Arc clone, so "multiple views, one owner, views never outlive owner" holds
// by construction. The buffer only ever grows — shrinking would invalidate
// the offsets of views already handed out (parameter sub-allocation depends
// on this).
//
// The RwLock gates interior mutation. The execution model of the library is
// strictly single-threaded, so the lock is never contended; it exists so
// views can write through a shared buffer without unsafe code.

/// Shared growable buffer of elements backing one or more tensors.
pub struct Storage<T> {
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for Storage<T> {
    fn clone(&self) -> Self {
        Storage {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Float> Storage<T> {
    /// Allocate a zero-filled buffer of `len` elements.
    pub fn new(len: usize) -> Self {
        Storage {
            data: Arc::new(RwLock::new(vec![T::ZERO; len])),
        }
    }

    /// Take ownership of an existing buffer.
    pub fn from_vec(v: Vec<T>) -> Self {
        Storage {
            data: Arc::new(RwLock::new(v)),
        }
    }

    /// Current length in elements.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the buffer to at least `len` elements, zero-filling the new
    /// tail. Never shrinks: views created before the growth keep their
    /// offsets.
    pub fn grow_to(&self, len: usize) {
        let mut data = self.write();
        if data.len() < len {
            data.resize(len, T::ZERO);
        }
    }

    /// Read access to the raw buffer.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().expect("storage lock poisoned")
    }

    /// Write access to the raw buffer.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().expect("storage lock poisoned")
    }

    /// Whether two storages are the same allocation (aliasing check).
    pub fn ptr_eq(&self, other: &Storage<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
