//! Binding layout of the flat device buffer table

use crate::MemoryError;

/// Shape of the device buffer table: inputs then outputs, repeated per slot.
///
/// Binding `(slot, tensor)` lives at `tensor + slot * step_size`. Every
/// component that addresses the table goes through [`BindingLayout::binding_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingLayout {
    num_inputs: usize,
    num_outputs: usize,
    max_batch_size: usize,
}

impl BindingLayout {
    /// Create a layout for the given tensor counts and batch capacity
    pub fn new(num_inputs: usize, num_outputs: usize, max_batch_size: usize) -> Self {
        Self {
            num_inputs,
            num_outputs,
            max_batch_size,
        }
    }

    /// Number of input bindings per slot
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Number of output bindings per slot
    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    /// Maximum number of batch slots
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Bindings per batch slot
    pub fn step_size(&self) -> usize {
        self.num_inputs + self.num_outputs
    }

    /// Total number of blocks in the table
    pub fn len(&self) -> usize {
        self.max_batch_size * self.step_size()
    }

    /// Check if the layout addresses no blocks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of `tensor` (inputs first, then outputs) in batch `slot`
    pub fn binding_index(&self, slot: usize, tensor: usize) -> Result<usize, MemoryError> {
        if slot >= self.max_batch_size {
            return Err(MemoryError::SlotOutOfRange {
                slot,
                max_batch_size: self.max_batch_size,
            });
        }
        if tensor >= self.step_size() {
            return Err(MemoryError::TensorOutOfRange {
                tensor,
                step_size: self.step_size(),
            });
        }
        Ok(tensor + slot * self.step_size())
    }

    /// Flat index of input `input` in batch `slot`
    pub fn input_index(&self, slot: usize, input: usize) -> Result<usize, MemoryError> {
        if input >= self.num_inputs {
            return Err(MemoryError::TensorOutOfRange {
                tensor: input,
                step_size: self.num_inputs,
            });
        }
        self.binding_index(slot, input)
    }

    /// Flat index of output `output` in batch `slot`
    pub fn output_index(&self, slot: usize, output: usize) -> Result<usize, MemoryError> {
        if output >= self.num_outputs {
            return Err(MemoryError::TensorOutOfRange {
                tensor: self.num_inputs + output,
                step_size: self.step_size(),
            });
        }
        self.binding_index(slot, self.num_inputs + output)
    }
}
