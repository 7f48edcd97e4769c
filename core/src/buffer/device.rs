//! Device abstraction for engine buffers.
//!
//! A `Device` decides where buffers live and provides the two services the engine needs from
//! an allocation facility: zero-initialized output buffers, and a synchronization point that
//! guarantees all queued work has retired before results are handed back.

use super::{Element, Storage};
use crate::error::Result;
use std::fmt::Debug;

/// The memory space holding input shards and output buffers.
///
/// Implementations for accelerators would use device allocations as their `Storage` and
/// block in [`Device::synchronize`] until their streams are idle.
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: Element;

    /// Returns the name of the device.
    fn name(&self) -> &'static str;

    /// Allocates `len` zero-initialized elements.
    fn alloc_zeroed<T: Element>(&self, len: usize) -> Self::Storage<T>;

    /// Moves host data into device storage.
    fn upload<T: Element>(&self, host: Vec<T>) -> Self::Storage<T>;

    /// Blocks until all work issued on this device has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Host memory, with kernels parallelized by `rayon`.
///
/// Work issued on the CPU device is synchronous, so [`Device::synchronize`] returns
/// immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Vec<T>
    where
        T: Element;

    fn name(&self) -> &'static str {
        "CPU"
    }

    fn alloc_zeroed<T: Element>(&self, len: usize) -> Vec<T> {
        vec![T::zero(); len]
    }

    fn upload<T: Element>(&self, host: Vec<T>) -> Vec<T> {
        host
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_alloc_zeroed() {
        let buf: Vec<f32> = Cpu.alloc_zeroed(4);
        assert_eq!(buf, vec![0.0; 4]);
        assert_eq!(Cpu.name(), "CPU");
        assert!(Cpu.synchronize().is_ok());
    }
}
