//! Flat device buffer table

use tracing::{debug, error};

use crate::{BindingLayout, DeviceAllocator, DeviceBlock, DevicePtr, MemoryError};

/// Pre-allocated device blocks for every binding of every batch slot.
///
/// Sized once for the maximum batch and never resized. Dropping the table
/// frees every block exactly once.
pub struct DeviceBufferTable {
    layout: BindingLayout,
    blocks: Box<[Box<dyn DeviceBlock>]>,
}

impl DeviceBufferTable {
    /// Allocate every block of `layout`.
    ///
    /// `tensor_sizes` holds the per-item byte size of each binding within a
    /// slot, inputs first. Allocation is all-or-nothing: on failure every
    /// block allocated so far is released before the error is returned.
    pub fn allocate(
        allocator: &dyn DeviceAllocator,
        layout: BindingLayout,
        tensor_sizes: &[usize],
    ) -> Result<Self, MemoryError> {
        if tensor_sizes.len() != layout.step_size() {
            return Err(MemoryError::LayoutMismatch {
                expected: layout.step_size(),
                actual: tensor_sizes.len(),
            });
        }

        let mut blocks = Vec::with_capacity(layout.len());
        for slot in 0..layout.max_batch_size() {
            for (tensor, &size) in tensor_sizes.iter().enumerate() {
                debug_assert_eq!(blocks.len(), layout.binding_index(slot, tensor)?);
                match allocator.allocate(size) {
                    Ok(block) => blocks.push(block),
                    Err(e) => {
                        error!(
                            "Device allocation failed at slot {} tensor {}: {}; releasing {} blocks",
                            slot,
                            tensor,
                            e,
                            blocks.len()
                        );
                        return Err(e);
                    }
                }
            }
        }

        debug!(
            "Allocated device buffer table: {} slots x {} bindings",
            layout.max_batch_size(),
            layout.step_size()
        );

        Ok(Self {
            layout,
            blocks: blocks.into_boxed_slice(),
        })
    }

    /// Layout of this table
    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the table holds no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block for binding `tensor` of batch `slot`
    pub fn block(&self, slot: usize, tensor: usize) -> Result<&dyn DeviceBlock, MemoryError> {
        let idx = self.layout.binding_index(slot, tensor)?;
        Ok(&*self.blocks[idx])
    }

    /// Mutable block for binding `tensor` of batch `slot`
    pub fn block_mut(
        &mut self,
        slot: usize,
        tensor: usize,
    ) -> Result<&mut dyn DeviceBlock, MemoryError> {
        let idx = self.layout.binding_index(slot, tensor)?;
        Ok(&mut *self.blocks[idx])
    }

    /// Host to device copy into binding `tensor` of `slot`
    pub fn write(&mut self, slot: usize, tensor: usize, src: &[u8]) -> Result<(), MemoryError> {
        self.block_mut(slot, tensor)?.copy_from_host(src)
    }

    /// Device to host copy out of binding `tensor` of `slot`
    pub fn read(&self, slot: usize, tensor: usize, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.block(slot, tensor)?.copy_to_host(dst)
    }

    /// Host to device copy into input `input` of `slot`
    pub fn write_input(&mut self, slot: usize, input: usize, src: &[u8]) -> Result<(), MemoryError> {
        let idx = self.layout.input_index(slot, input)?;
        self.blocks[idx].copy_from_host(src)
    }

    /// Device to host copy out of input `input` of `slot`
    pub fn read_input(&self, slot: usize, input: usize, dst: &mut [u8]) -> Result<(), MemoryError> {
        let idx = self.layout.input_index(slot, input)?;
        self.blocks[idx].copy_to_host(dst)
    }

    /// Host to device copy into output `output` of `slot`
    pub fn write_output(
        &mut self,
        slot: usize,
        output: usize,
        src: &[u8],
    ) -> Result<(), MemoryError> {
        let idx = self.layout.output_index(slot, output)?;
        self.blocks[idx].copy_from_host(src)
    }

    /// Device to host copy out of output `output` of `slot`
    pub fn read_output(&self, slot: usize, output: usize, dst: &mut [u8]) -> Result<(), MemoryError> {
        let idx = self.layout.output_index(slot, output)?;
        self.blocks[idx].copy_to_host(dst)
    }

    /// Byte size of binding `tensor` (identical across slots)
    pub fn binding_size(&self, tensor: usize) -> Result<usize, MemoryError> {
        Ok(self.block(0, tensor)?.len())
    }

    /// Device addresses of every block, in binding order
    pub fn device_ptrs(&self) -> Vec<DevicePtr> {
        self.blocks.iter().map(|b| b.device_ptr()).collect()
    }
}

impl std::fmt::Debug for DeviceBufferTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBufferTable")
            .field("layout", &self.layout)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}
