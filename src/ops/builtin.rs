use ndarray::{concatenate, ArrayView, Axis, Ix2, IxDyn, Zip};
use num_traits::ToPrimitive;

use crate::error::{Error, Result};
use super::registry::ReplayOperator;
use super::tensor::{DataType, Tensor};
use super::value::{OpArg, OpValue};

fn tensor_arg<'a>(name: &str, args: &'a [OpArg], index: usize) -> Result<&'a Tensor> {
    args.get(index).and_then(|a| a.tensor()).ok_or_else(|| {
        Error::OperatorError(format!("{} requires a tensor at argument {}", name, index))
    })
}

/// Elementwise binary operator; the second operand may be a scalar or broadcast into the first
#[derive(Debug, Clone)]
pub struct ElementwiseBinary {
    name: &'static str,
    op: fn(f32, f32) -> f32,
}

impl ElementwiseBinary {
    pub fn add() -> Self {
        Self { name: "aten::add", op: |a, b| a + b }
    }

    pub fn mul() -> Self {
        Self { name: "aten::mul", op: |a, b| a * b }
    }
}

impl ReplayOperator for ElementwiseBinary {
    fn name(&self) -> &str {
        self.name
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let lhs = tensor_arg(self.name, args, 0)?;
        let op = self.op;

        let data = match args.get(1) {
            Some(OpArg::Tensor(Some(rhs))) => {
                let rhs = rhs.data.broadcast(lhs.shape()).ok_or_else(|| {
                    Error::OperatorError(format!(
                        "{}: cannot broadcast {:?} into {:?}",
                        self.name,
                        rhs.shape(),
                        lhs.shape()
                    ))
                })?;
                Zip::from(&lhs.data).and(&rhs).map_collect(|&a, &b| op(a, b))
            }
            Some(scalar @ (OpArg::Scalar(_) | OpArg::Float(_))) => {
                let b = scalar.as_f64().ok_or_else(|| {
                    Error::OperatorError(format!("{}: non-numeric scalar operand", self.name))
                })? as f32;
                lhs.data.mapv(|a| op(a, b))
            }
            _ => {
                return Err(Error::OperatorError(format!(
                    "{} requires a second operand",
                    self.name
                )))
            }
        };

        let mut result = Tensor::from_array(data, lhs.data_type);
        result.device = lhs.device.clone();
        Ok(vec![OpValue::Tensor(result)])
    }
}

/// Elementwise unary operator
#[derive(Debug, Clone)]
pub struct ElementwiseUnary {
    name: &'static str,
    op: fn(f32) -> f32,
}

impl ElementwiseUnary {
    pub fn relu() -> Self {
        Self { name: "aten::relu", op: |x| x.max(0.0) }
    }

    pub fn sigmoid() -> Self {
        Self { name: "aten::sigmoid", op: |x| 1.0 / (1.0 + (-x).exp()) }
    }
}

impl ReplayOperator for ElementwiseUnary {
    fn name(&self) -> &str {
        self.name
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let input = tensor_arg(self.name, args, 0)?;
        let mut result = Tensor::from_array(input.data.mapv(self.op), input.data_type);
        result.device = input.device.clone();
        Ok(vec![OpValue::Tensor(result)])
    }
}

/// Two-dimensional matrix product
#[derive(Debug, Clone, Default)]
pub struct MatMul;

impl ReplayOperator for MatMul {
    fn name(&self) -> &str {
        "aten::mm"
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let a = tensor_arg("aten::mm", args, 0)?;
        let b = tensor_arg("aten::mm", args, 1)?;

        let a2 = a.data.view().into_dimensionality::<Ix2>()
            .map_err(|e| Error::OperatorError(format!("aten::mm: {}", e)))?;
        let b2 = b.data.view().into_dimensionality::<Ix2>()
            .map_err(|e| Error::OperatorError(format!("aten::mm: {}", e)))?;

        if a2.ncols() != b2.nrows() {
            return Err(Error::OperatorError(format!(
                "aten::mm: inner dimensions differ ({:?} x {:?})",
                a.shape(),
                b.shape()
            )));
        }

        let mut result = Tensor::from_array(a2.dot(&b2).into_dyn(), a.data_type);
        result.device = a.device.clone();
        Ok(vec![OpValue::Tensor(result)])
    }
}

/// Concatenation of a tensor list along a dimension
#[derive(Debug, Clone, Default)]
pub struct Cat;

impl ReplayOperator for Cat {
    fn name(&self) -> &str {
        "aten::cat"
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let tensors = args
            .first()
            .and_then(|a| a.tensor_list())
            .filter(|list| !list.is_empty())
            .ok_or_else(|| Error::OperatorError("aten::cat requires a non-empty tensor list".to_string()))?;
        let dim = args.get(1).and_then(|a| a.as_i64()).unwrap_or(0);

        let rank = tensors[0].shape().len() as i64;
        let axis = if dim < 0 { dim + rank } else { dim };
        if axis < 0 || axis >= rank.max(1) {
            return Err(Error::OperatorError(format!("aten::cat: dimension {} out of range", dim)));
        }

        let views: Vec<ArrayView<f32, IxDyn>> = tensors.iter().map(|t| t.data.view()).collect();
        let data = concatenate(Axis(axis as usize), &views)
            .map_err(|e| Error::OperatorError(format!("aten::cat: {}", e)))?;

        let mut result = Tensor::from_array(data, tensors[0].data_type);
        result.device = tensors[0].device.clone();
        Ok(vec![OpValue::Tensor(result)])
    }
}

/// Sum-mode bag gather over an embedding table
///
/// Arguments follow the trace order: weights `[rows, dim]`, indices `[nnz]`,
/// offsets `[bags]`. Returns the pooled output followed by the three auxiliary
/// tensors the traced operator also produces.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingBag;

impl ReplayOperator for EmbeddingBag {
    fn name(&self) -> &str {
        "aten::embedding_bag"
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let weight = tensor_arg("aten::embedding_bag", args, 0)?;
        let indices = tensor_arg("aten::embedding_bag", args, 1)?.to_vec();
        let offsets = tensor_arg("aten::embedding_bag", args, 2)?.to_vec();

        let table = weight.data.view().into_dimensionality::<Ix2>()
            .map_err(|e| Error::OperatorError(format!("aten::embedding_bag: {}", e)))?;
        let (rows, dim) = table.dim();
        let bags = offsets.len();

        let to_index = |value: f32| -> Result<usize> {
            value.to_usize().ok_or_else(|| {
                Error::OperatorError(format!("aten::embedding_bag: invalid index {}", value))
            })
        };

        let mut pooled = vec![0.0f32; bags * dim];
        for bag in 0..bags {
            let start = to_index(offsets[bag])?.min(indices.len());
            let end = match offsets.get(bag + 1) {
                Some(&next) => to_index(next)?.min(indices.len()),
                None => indices.len(),
            };

            for &index in &indices[start..end.max(start)] {
                let row = to_index(index)?;
                if row >= rows {
                    return Err(Error::OperatorError(format!(
                        "aten::embedding_bag: index {} out of range for {} rows",
                        row, rows
                    )));
                }
                for (slot, value) in pooled[bag * dim..(bag + 1) * dim].iter_mut().zip(table.row(row)) {
                    *slot += *value;
                }
            }
        }

        let mut output = Tensor::from_vec(&[bags, dim], pooled, weight.data_type)?;
        output.device = weight.device.clone();
        let aux = |shape: &[usize]| {
            let mut t = Tensor::zeros(shape, DataType::Int64);
            t.device = weight.device.clone();
            OpValue::Tensor(t)
        };

        Ok(vec![
            OpValue::Tensor(output),
            aux(&[indices.len()]),
            aux(&[bags]),
            aux(&[bags]),
        ])
    }
}

/// Returns its first tensor argument, moved to a requested device if one is given
#[derive(Debug, Clone)]
pub struct Passthrough {
    name: String,
}

impl Passthrough {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ReplayOperator for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let input = tensor_arg(&self.name, args, 0)?;
        let device = args.iter().skip(1).find_map(|a| match a {
            OpArg::Device(device) => Some(device.clone()),
            _ => None,
        });

        let result = match device {
            Some(device) => input.with_device(device),
            None => input.clone(),
        };
        Ok(vec![OpValue::Tensor(result)])
    }
}
