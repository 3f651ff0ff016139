use serde_json::Value;

use super::tensor::{Device, Tensor};

/// A positional argument handed to an operator at replay time
#[derive(Debug, Clone)]
pub enum OpArg {
    /// A tensor slot; `None` when the registry holds no value for it
    Tensor(Option<Tensor>),
    TensorList(Vec<Option<Tensor>>),
    Absent,
    Device(Device),
    /// Float scalar that JSON cannot carry, such as infinity
    Float(f64),
    Scalar(Value),
}

impl OpArg {
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            OpArg::Tensor(tensor) => tensor.as_ref(),
            _ => None,
        }
    }

    /// Every element of a tensor list, or `None` if any slot is empty
    pub fn tensor_list(&self) -> Option<Vec<&Tensor>> {
        match self {
            OpArg::TensorList(tensors) => tensors.iter().map(|t| t.as_ref()).collect(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OpArg::Float(value) => Some(*value),
            OpArg::Scalar(value) => value.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OpArg::Scalar(value) => value.as_i64(),
            _ => None,
        }
    }

    /// Short description used in error messages
    pub fn describe(&self) -> String {
        match self {
            OpArg::Tensor(Some(tensor)) => format!("Tensor{:?}", tensor.shape()),
            OpArg::Tensor(None) => "Tensor(null)".to_string(),
            OpArg::TensorList(tensors) => format!("TensorList[{}]", tensors.len()),
            OpArg::Absent => "None".to_string(),
            OpArg::Device(device) => device.to_string(),
            OpArg::Float(value) => value.to_string(),
            OpArg::Scalar(value) => value.to_string(),
        }
    }
}

/// Describe a whole argument list
pub fn describe_args(args: &[OpArg]) -> String {
    let parts: Vec<String> = args.iter().map(|a| a.describe()).collect();
    format!("[{}]", parts.join(", "))
}

/// A value returned by an operator
#[derive(Debug, Clone)]
pub enum OpValue {
    Tensor(Tensor),
    TensorList(Vec<Tensor>),
    /// Non-tensor results are accepted and ignored
    Other(Value),
}

/// Splice returned values into one ordered tensor sequence
///
/// Lists are expanded in place and non-tensor values dropped, matching the
/// order in which the trace records output tensors.
pub fn flatten_outputs(values: Vec<OpValue>) -> Vec<Tensor> {
    let mut tensors = Vec::with_capacity(values.len());
    for value in values {
        match value {
            OpValue::Tensor(tensor) => tensors.push(tensor),
            OpValue::TensorList(list) => tensors.extend(list),
            OpValue::Other(_) => {}
        }
    }
    tensors
}
