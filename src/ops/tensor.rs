use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use ndarray::{ArcArray, ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Element types found in captured traces
///
/// The string forms are the element names the tracer writes inside
/// `Tensor(...)`, so `"long int".parse::<DataType>()` works directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
pub enum DataType {
    #[strum(to_string = "float", serialize = "float32")]
    Float32,
    #[strum(to_string = "double", serialize = "float64")]
    Float64,
    #[strum(to_string = "c10::Half", serialize = "half", serialize = "float16")]
    Float16,
    #[strum(to_string = "c10::BFloat16", serialize = "bfloat16")]
    BFloat16,
    #[strum(to_string = "signed char", serialize = "int8")]
    Int8,
    #[strum(to_string = "unsigned char", serialize = "uint8")]
    Uint8,
    #[strum(to_string = "short", serialize = "int16")]
    Int16,
    #[strum(to_string = "int", serialize = "int32")]
    Int32,
    #[strum(to_string = "long", serialize = "long int", serialize = "int64")]
    Int64,
    #[strum(to_string = "bool")]
    Bool,
}

impl DataType {
    /// Resolve a trace element name
    pub fn from_element(name: &str) -> Result<Self> {
        DataType::from_str(name.trim())
            .map_err(|_| Error::UnsupportedDataType(name.to_string()))
    }

    /// Get the size in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Float16 => 2,
            DataType::BFloat16 => 2,
            DataType::Int8 => 1,
            DataType::Uint8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Bool => 1,
        }
    }

    /// Check if data type is a floating point type
    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float64 | DataType::Float16 | DataType::BFloat16
        )
    }

    /// Check if data type is integer (signed or unsigned)
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Uint8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }
}

/// Where a tensor value lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    /// Accelerator device, optionally with an explicit ordinal
    Cuda(Option<u32>),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cuda(None)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(None) => write!(f, "cuda"),
            Device::Cuda(Some(ordinal)) => write!(f, "cuda:{}", ordinal),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        if text == "cpu" {
            return Ok(Device::Cpu);
        }
        if text == "cuda" {
            return Ok(Device::Cuda(None));
        }
        if let Some(ordinal) = text.strip_prefix("cuda:") {
            return ordinal
                .parse::<u32>()
                .map(|o| Device::Cuda(Some(o)))
                .map_err(|_| Error::Device(format!("invalid device ordinal in '{}'", text)));
        }
        Err(Error::Device(format!("unknown device '{}'", text)))
    }
}

impl TryFrom<String> for Device {
    type Error = Error;

    fn try_from(text: String) -> Result<Self> {
        text.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Tensor value used during replay
///
/// Values are stored as `f32` whatever the logical data type, as replay
/// measures dispatch cost rather than numerics. Storage is reference counted
/// and copy-on-write, so cloning a tensor never copies its elements.
#[derive(Clone)]
pub struct Tensor {
    pub data_type: DataType,
    pub device: Device,
    pub data: ArcArray<f32, IxDyn>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {{ data_type: {:?}, device: {}, shape: {:?} }}",
            self.data_type,
            self.device,
            self.data.shape()
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.data_type == other.data_type && self.device == other.device && self.data == other.data
    }
}

impl Tensor {
    /// Create a host tensor filled with zeros
    pub fn zeros(shape: &[usize], data_type: DataType) -> Self {
        Self::from_array(ArrayD::zeros(IxDyn(shape)), data_type)
    }

    /// Create a host tensor filled with ones
    pub fn ones(shape: &[usize], data_type: DataType) -> Self {
        Self::from_array(ArrayD::ones(IxDyn(shape)), data_type)
    }

    /// Wrap an owned array as a host tensor
    pub fn from_array(data: ArrayD<f32>, data_type: DataType) -> Self {
        Self {
            data_type,
            device: Device::Cpu,
            data: data.into_shared(),
        }
    }

    /// Build a host tensor from row-major values
    pub fn from_vec(shape: &[usize], values: Vec<f32>, data_type: DataType) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| Error::OperatorError(format!("shape mismatch building tensor: {}", e)))?;
        Ok(Self::from_array(data, data_type))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Logical footprint of the value in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.data_type.size_in_bytes()
    }

    /// Same value, tagged with a different placement
    pub fn with_device(&self, device: Device) -> Self {
        Self {
            data_type: self.data_type,
            device,
            data: self.data.clone(),
        }
    }

    /// True when both tensors point at the same element buffer
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        std::ptr::eq(self.data.as_ptr(), other.data.as_ptr())
    }

    /// Overwrite a single element in logical (row-major) order
    pub fn set_flat(&mut self, index: usize, value: f32) -> Result<()> {
        let len = self.len();
        match self.data.iter_mut().nth(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::OperatorError(format!(
                "element index {} out of range for tensor of {} elements",
                index, len
            ))),
        }
    }

    /// Elements in logical order
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// Generate a value of the given data type and shape
///
/// Floating types are drawn from a standard normal distribution (rounded
/// through the 16-bit formats where applicable). Integer and boolean types are
/// filled with ones so they stay valid as indices.
pub fn synthesize_tensor<R: Rng>(shape: &[usize], data_type: DataType, rng: &mut R) -> Tensor {
    if !data_type.is_floating_point() {
        return Tensor::ones(shape, data_type);
    }

    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count)
        .map(|_| {
            let x: f32 = rng.sample(StandardNormal);
            match data_type {
                DataType::Float16 => f16::from_f32(x).to_f32(),
                DataType::BFloat16 => bf16::from_f32(x).to_f32(),
                _ => x,
            }
        })
        .collect();

    let data = ArrayD::from_shape_vec(IxDyn(shape), values)
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)));
    Tensor::from_array(data, data_type)
}
