use core::fmt::Debug;
use core::ops::{Deref, DerefMut};

/// A wrapper that tracks whether the inner value has diverged from its
/// on-disk copy. Any mutable access marks the value dirty.
pub struct Dirty<T> {
    value: T,
    dirty: bool,
}

impl<T> Dirty<T> {
    /// Wraps a value that matches its on-disk copy.
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    /// Wraps a value that has no on-disk copy yet.
    pub fn new_dirty(value: T) -> Self {
        Self { value, dirty: true }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Resets the flag after the value has been written back.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl<T> Deref for Dirty<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Dirty<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }
}

impl<T: Debug> Debug for Dirty<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Dirty")
            .field("value", &self.value)
            .field("dirty", &self.dirty)
            .finish()
    }
}
