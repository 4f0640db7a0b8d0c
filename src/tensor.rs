use serde::{Deserialize, Serialize};

use crate::status::{Result, Status};

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }

    pub fn scalar(value: T) -> Self {
        Self { data: vec![value] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub trait TensorElement: Sized + Clone {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>>;
}

impl TensorElement for f32 {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
        match value {
            TensorValue::F32(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }
}

impl TensorElement for f64 {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
        match value {
            TensorValue::F64(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }
}

impl TensorElement for i32 {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
        match value {
            TensorValue::I32(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }
}

impl TensorElement for i64 {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
        match value {
            TensorValue::I64(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }
}

impl TensorElement for bool {
    fn from_value(value: &TensorValue) -> Option<Tensor<Self>> {
        match value {
            TensorValue::Bool(tensor) => Some(tensor.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
    /// A handle naming a tensor kept in the session tensor store.
    Resource,
}

impl DType {
    pub fn from_ident(ident: &str) -> Result<Self> {
        match ident {
            "f32" => Ok(DType::F32),
            "f64" => Ok(DType::F64),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "bool" => Ok(DType::Bool),
            "resource" => Ok(DType::Resource),
            _ => Err(Status::invalid_argument(format!(
                "unsupported dtype: {ident}"
            ))),
        }
    }
}

/// Resource handles carry the container and the stored tensor's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub container: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    F32(Tensor<f32>),
    F64(Tensor<f64>),
    I32(Tensor<i32>),
    I64(Tensor<i64>),
    Bool(Tensor<bool>),
    Resource(ResourceHandle),
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F32(_) => DType::F32,
            TensorValue::F64(_) => DType::F64,
            TensorValue::I32(_) => DType::I32,
            TensorValue::I64(_) => DType::I64,
            TensorValue::Bool(_) => DType::Bool,
            TensorValue::Resource(_) => DType::Resource,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorValue::F32(tensor) => tensor.len(),
            TensorValue::F64(tensor) => tensor.len(),
            TensorValue::I32(tensor) => tensor.len(),
            TensorValue::I64(tensor) => tensor.len(),
            TensorValue::Bool(tensor) => tensor.len(),
            TensorValue::Resource(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate payload size, fed to the byte histograms.
    pub fn byte_size(&self) -> usize {
        match self {
            TensorValue::F32(tensor) => tensor.len() * 4,
            TensorValue::F64(tensor) => tensor.len() * 8,
            TensorValue::I32(tensor) => tensor.len() * 4,
            TensorValue::I64(tensor) => tensor.len() * 8,
            TensorValue::Bool(tensor) => tensor.len(),
            TensorValue::Resource(handle) => handle.container.len() + handle.name.len(),
        }
    }

    pub fn zeros(dtype: DType, len: usize) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(TensorValue::F32(Tensor::new(vec![0.0; len]))),
            DType::F64 => Ok(TensorValue::F64(Tensor::new(vec![0.0; len]))),
            DType::I32 => Ok(TensorValue::I32(Tensor::new(vec![0; len]))),
            DType::I64 => Ok(TensorValue::I64(Tensor::new(vec![0; len]))),
            DType::Bool => Ok(TensorValue::Bool(Tensor::new(vec![false; len]))),
            DType::Resource => Err(Status::invalid_argument(
                "resource tensors have no zero value",
            )),
        }
    }

    pub fn as_f32(&self) -> Result<&Tensor<f32>> {
        match self {
            TensorValue::F32(tensor) => Ok(tensor),
            other => Err(Status::invalid_argument(format!(
                "expected f32 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    pub fn as_i32(&self) -> Result<&Tensor<i32>> {
        match self {
            TensorValue::I32(tensor) => Ok(tensor),
            other => Err(Status::invalid_argument(format!(
                "expected i32 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    pub fn as_i64(&self) -> Result<&Tensor<i64>> {
        match self {
            TensorValue::I64(tensor) => Ok(tensor),
            other => Err(Status::invalid_argument(format!(
                "expected i64 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    pub fn as_resource(&self) -> Result<&ResourceHandle> {
        match self {
            TensorValue::Resource(handle) => Ok(handle),
            other => Err(Status::invalid_argument(format!(
                "expected resource handle, got {:?}",
                other.dtype()
            ))),
        }
    }
}

impl From<Vec<f32>> for TensorValue {
    fn from(value: Vec<f32>) -> Self {
        TensorValue::F32(Tensor::new(value))
    }
}

impl From<Vec<f64>> for TensorValue {
    fn from(value: Vec<f64>) -> Self {
        TensorValue::F64(Tensor::new(value))
    }
}

impl From<Vec<i32>> for TensorValue {
    fn from(value: Vec<i32>) -> Self {
        TensorValue::I32(Tensor::new(value))
    }
}

impl From<Vec<i64>> for TensorValue {
    fn from(value: Vec<i64>) -> Self {
        TensorValue::I64(Tensor::new(value))
    }
}

impl From<Vec<bool>> for TensorValue {
    fn from(value: Vec<bool>) -> Self {
        TensorValue::Bool(Tensor::new(value))
    }
}

impl From<i32> for TensorValue {
    fn from(value: i32) -> Self {
        TensorValue::I32(Tensor::scalar(value))
    }
}

impl From<i64> for TensorValue {
    fn from(value: i64) -> Self {
        TensorValue::I64(Tensor::scalar(value))
    }
}

impl From<f32> for TensorValue {
    fn from(value: f32) -> Self {
        TensorValue::F32(Tensor::scalar(value))
    }
}
