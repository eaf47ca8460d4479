//! Human-readable binding report

use std::fmt;

use crate::tensor::{BindingInfo, DataType, Dims};

/// One binding of a compiled engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSummary {
    pub index: usize,
    pub name: String,
    pub is_input: bool,
    pub data_type: DataType,
    pub dims: Dims,
}

impl BindingSummary {
    pub(crate) fn from_info(index: usize, info: BindingInfo) -> Self {
        Self {
            index,
            name: info.name,
            is_input: info.is_input,
            data_type: info.data_type,
            dims: info.dims,
        }
    }
}

/// Bindings of a compiled engine, in binding order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSummary {
    pub bindings: Vec<BindingSummary>,
}

impl EngineSummary {
    /// Number of bindings
    pub fn num_bindings(&self) -> usize {
        self.bindings.len()
    }

    /// Input bindings
    pub fn inputs(&self) -> impl Iterator<Item = &BindingSummary> {
        self.bindings.iter().filter(|b| b.is_input)
    }

    /// Output bindings
    pub fn outputs(&self) -> impl Iterator<Item = &BindingSummary> {
        self.bindings.iter().filter(|b| !b.is_input)
    }
}

impl fmt::Display for EngineSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for binding in &self.bindings {
            writeln!(f, "--Binding {}--", binding.index)?;
            writeln!(
                f,
                "Type: {} DataType: {} Dims: {}",
                if binding.is_input { "Input" } else { "Output" },
                binding.data_type,
                binding.dims
            )?;
        }
        Ok(())
    }
}
