//! Tensor descriptors and binding metadata

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tensor dimensions in channel-first order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dims(Vec<usize>);

impl Dims {
    /// Create dims from extents
    pub fn new(extents: impl Into<Vec<usize>>) -> Self {
        Self(extents.into())
    }

    /// Channel, height, width
    pub fn chw(c: usize, h: usize, w: usize) -> Self {
        Self(vec![c, h, w])
    }

    /// Number of elements
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Extents as a slice
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Dims {
    fn from(extents: Vec<usize>) -> Self {
        Self(extents)
    }
}

impl From<&[usize]> for Dims {
    fn from(extents: &[usize]) -> Self {
        Self(extents.to_vec())
    }
}

impl fmt::Display for Dims {
    /// Renders as `(d0,d1,...,)`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for d in &self.0 {
            write!(f, "{},", d)?;
        }
        write!(f, ")")
    }
}

/// Element type of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit float
    Float,
    /// 16-bit float
    Half,
    /// 8-bit quantized integer
    Int8,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Half => 2,
            DataType::Int8 => 1,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float => "kFLOAT",
            DataType::Half => "kHALF",
            DataType::Int8 => "kINT8",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric precision used when compiling the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// FP32
    #[default]
    Full,
    /// FP16
    Half,
    /// INT8 quantized
    Int8,
}

impl Precision {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Full => "fp32",
            Precision::Half => "fp16",
            Precision::Int8 => "int8",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered graph input or output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    name: String,
    dims: Option<Dims>,
    element_size: usize,
    byte_size: usize,
}

impl TensorDescriptor {
    /// Input descriptor; per-item size is `volume(dims) * element_size`
    pub fn input(name: impl Into<String>, dims: Dims, element_size: usize) -> Self {
        let byte_size = dims.volume() * element_size;
        Self {
            name: name.into(),
            dims: Some(dims),
            element_size,
            byte_size,
        }
    }

    /// Output descriptor; the compiled engine resolves the shape
    pub fn output(name: impl Into<String>, byte_size: usize) -> Self {
        Self {
            name: name.into(),
            dims: None,
            element_size: byte_size,
            byte_size,
        }
    }

    /// Tensor name in the graph
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered dims (inputs only)
    pub fn dims(&self) -> Option<&Dims> {
        self.dims.as_ref()
    }

    /// Registered element size in bytes
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Bytes per batch item
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }
}

/// Binding metadata reported by a compiled engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub name: String,
    pub is_input: bool,
    pub data_type: DataType,
    pub dims: Dims,
}
