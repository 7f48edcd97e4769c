//! Storage abstraction for device buffers.
//!
//! A `Storage` is the container that owns the raw elements of a buffer, while
//! [`Matrix`](super::Matrix) and [`DeviceArray`](super::DeviceArray) carry shape and layout.
//! The engine only ever needs slice access, which is all this trait exposes.

use super::Element;
use std::fmt::Debug;

/// A contiguous block of elements owned by a [`Device`](super::Device).
pub trait Storage<T>: Clone + Debug + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns `true` if the storage contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host memory storage, used by [`Cpu`](super::Cpu).
impl<T: Element> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}
