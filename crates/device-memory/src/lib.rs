//! Device Buffer Pool
//!
//! Owns the device allocations backing every input and output binding of
//! every batch slot. Blocks are laid out as one flat table and addressed by
//! `(slot, tensor)` through [`BindingLayout`].

mod allocator;
mod layout;
mod table;

pub use allocator::{DeviceAllocator, DeviceBlock, DevicePtr, HostAllocator, HostBlock};
pub use layout::BindingLayout;
pub use table::DeviceBufferTable;

use thiserror::Error;

/// Device memory errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Batch slot {slot} out of range (max batch size {max_batch_size})")]
    SlotOutOfRange { slot: usize, max_batch_size: usize },

    #[error("Tensor index {tensor} out of range ({step_size} bindings per slot)")]
    TensorOutOfRange { tensor: usize, step_size: usize },

    #[error("Copy size mismatch: block holds {expected} bytes, host buffer has {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Expected {expected} tensor sizes for layout, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },
}
