use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use super::types::{TypeDescriptor, UNINITIALIZED_ELEMENT};

/// Stable node identifier assigned by the tracer
pub type NodeId = u64;

/// Classification of a trace node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A unit of computation that may be replayed
    Operator,
    /// A scope marker; its children may still be replayed
    Label,
}

/// Identity of the storage a tensor argument referred to at capture time
///
/// Equal keys mean the same underlying buffer, whatever the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorKey {
    pub tensor_id: u64,
    pub storage_id: u64,
    pub offset: u64,
    pub num_elem: u64,
    pub elem_bytes: u64,
}

impl TensorKey {
    pub fn new(tensor_id: u64, storage_id: u64, offset: u64, num_elem: u64, elem_bytes: u64) -> Self {
        Self {
            tensor_id,
            storage_id,
            offset,
            num_elem,
            elem_bytes,
        }
    }

    /// Raw trace encoding, optionally extended with a device tag
    pub fn to_value(&self, device: Option<&str>) -> Value {
        match device {
            Some(device) => json!([
                self.tensor_id,
                self.storage_id,
                self.offset,
                self.num_elem,
                self.elem_bytes,
                device
            ]),
            None => json!([
                self.tensor_id,
                self.storage_id,
                self.offset,
                self.num_elem,
                self.elem_bytes
            ]),
        }
    }
}

/// A decoded tensor-typed argument
#[derive(Debug, Clone, PartialEq)]
pub struct TensorArg {
    pub key: TensorKey,
    /// Device tag, present only in device-aware traces
    pub device: Option<String>,
    pub shape: Vec<usize>,
    /// Element type name (`float`, `long`, ...)
    pub element: Option<String>,
}

impl TensorArg {
    /// The tracer saw an undefined tensor in this position
    pub fn is_uninitialized(&self) -> bool {
        self.element.as_deref() == Some(UNINITIALIZED_ELEMENT)
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A decoded positional argument of a node
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Tensor(TensorArg),
    TensorList(Vec<TensorArg>),
    /// `<None>` or `<Generator>` in the trace
    Absent,
    Device(String),
    /// Non-finite float, recorded as the string `inf` or `-inf`
    Float(f64),
    Scalar(Value),
}

impl Argument {
    /// Tensors carried by this argument, in order
    pub fn tensors(&self) -> &[TensorArg] {
        match self {
            Argument::Tensor(tensor) => std::slice::from_ref(tensor),
            Argument::TensorList(tensors) => tensors,
            _ => &[],
        }
    }
}

/// A node of the captured trace tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub inputs: Vec<Value>,
    #[serde(default)]
    pub input_types: Vec<String>,
    #[serde(default)]
    pub input_shapes: Vec<Value>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub output_types: Vec<String>,
    #[serde(default)]
    pub output_shapes: Vec<Value>,
    #[serde(default)]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    pub fn operator(id: NodeId, name: impl Into<String>) -> Self {
        Self::with_kind(id, name, NodeKind::Operator)
    }

    pub fn label(id: NodeId, name: impl Into<String>) -> Self {
        Self::with_kind(id, name, NodeKind::Label)
    }

    fn with_kind(id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            inputs: Vec::new(),
            input_types: Vec::new(),
            input_shapes: Vec::new(),
            outputs: Vec::new(),
            output_types: Vec::new(),
            output_shapes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Append a tensor input
    pub fn input_tensor(mut self, key: TensorKey, shape: &[usize], element: &str) -> Self {
        self.inputs.push(key.to_value(None));
        self.input_types.push(format!("Tensor({})", element));
        self.input_shapes.push(json!(shape));
        self
    }

    /// Append a tensor input carrying a device tag
    pub fn input_tensor_on(mut self, key: TensorKey, device: &str, shape: &[usize], element: &str) -> Self {
        self.inputs.push(key.to_value(Some(device)));
        self.input_types.push(format!("Tensor({})", element));
        self.input_shapes.push(json!(shape));
        self
    }

    /// Append a tensor-list input; all elements share one element type
    pub fn input_tensor_list(mut self, tensors: &[(TensorKey, Vec<usize>)], element: &str) -> Self {
        let ids: Vec<Value> = tensors.iter().map(|(key, _)| key.to_value(None)).collect();
        let shapes: Vec<Value> = tensors.iter().map(|(_, shape)| json!(shape)).collect();
        let types: Vec<String> = tensors.iter().map(|_| format!("Tensor({})", element)).collect();
        self.inputs.push(Value::Array(ids));
        self.input_types.push(format!("GenericList[{}]", types.join(",")));
        self.input_shapes.push(Value::Array(shapes));
        self
    }

    /// Append a non-tensor input
    pub fn input_scalar(mut self, value: Value, type_name: &str) -> Self {
        self.inputs.push(value);
        self.input_types.push(type_name.to_string());
        self.input_shapes.push(json!([]));
        self
    }

    /// Append a tensor output
    pub fn output_tensor(mut self, key: TensorKey, shape: &[usize], element: &str) -> Self {
        self.outputs.push(key.to_value(None));
        self.output_types.push(format!("Tensor({})", element));
        self.output_shapes.push(json!(shape));
        self
    }

    /// Append a tensor output carrying a device tag
    pub fn output_tensor_on(mut self, key: TensorKey, device: &str, shape: &[usize], element: &str) -> Self {
        self.outputs.push(key.to_value(Some(device)));
        self.output_types.push(format!("Tensor({})", element));
        self.output_shapes.push(json!(shape));
        self
    }

    pub fn child(mut self, child: TraceNode) -> Self {
        self.children.push(child);
        self
    }

    /// Decode the positional inputs of this node
    pub fn decode_inputs(&self) -> Result<Vec<Argument>> {
        decode_arguments(self.id, "input", &self.inputs, &self.input_types, &self.input_shapes)
    }

    /// Decode the outputs of this node
    pub fn decode_outputs(&self) -> Result<Vec<Argument>> {
        decode_arguments(self.id, "output", &self.outputs, &self.output_types, &self.output_shapes)
    }

    /// All tensors consumed by this node, tensor lists flattened in place
    pub fn input_tensors(&self) -> Result<Vec<TensorArg>> {
        Ok(flatten_tensors(self.decode_inputs()?))
    }

    /// All tensors produced by this node, tensor lists flattened in place
    pub fn output_tensors(&self) -> Result<Vec<TensorArg>> {
        Ok(flatten_tensors(self.decode_outputs()?))
    }

    /// Declared output types in grammar form
    pub fn output_descriptors(&self) -> Vec<TypeDescriptor> {
        self.output_types.iter().map(|t| TypeDescriptor::parse(t)).collect()
    }

    /// Depth-first visit of this node and its descendants
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a TraceNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

fn flatten_tensors(arguments: Vec<Argument>) -> Vec<TensorArg> {
    let mut tensors = Vec::new();
    for argument in arguments {
        match argument {
            Argument::Tensor(tensor) => tensors.push(tensor),
            Argument::TensorList(list) => tensors.extend(list),
            _ => {}
        }
    }
    tensors
}

fn decode_arguments(
    node_id: NodeId,
    role: &str,
    values: &[Value],
    types: &[String],
    shapes: &[Value],
) -> Result<Vec<Argument>> {
    let mut arguments = Vec::with_capacity(values.len());

    for (index, value) in values.iter().enumerate() {
        let type_name = types.get(index).ok_or_else(|| {
            Error::malformed(node_id, format!("missing type for {} {}", role, index))
        })?;

        let argument = match TypeDescriptor::parse(type_name) {
            TypeDescriptor::Tensor(element) => {
                let shape = shapes.get(index).ok_or_else(|| {
                    Error::malformed(node_id, format!("missing shape for {} {}", role, index))
                })?;
                Argument::Tensor(decode_tensor(node_id, value, shape, element)?)
            }
            descriptor @ TypeDescriptor::List(_) if descriptor.is_tensor_list() => {
                let shape = shapes.get(index).ok_or_else(|| {
                    Error::malformed(node_id, format!("missing shape for {} {}", role, index))
                })?;
                Argument::TensorList(decode_tensor_list(node_id, value, shape, &descriptor)?)
            }
            TypeDescriptor::Opaque(name) if name == "Device" => match value.as_str() {
                Some(device) => Argument::Device(device.to_string()),
                None => Argument::Scalar(value.clone()),
            },
            _ => match value.as_str() {
                Some("<None>") | Some("<Generator>") => Argument::Absent,
                Some("inf") => Argument::Float(f64::INFINITY),
                Some("-inf") => Argument::Float(f64::NEG_INFINITY),
                _ => Argument::Scalar(value.clone()),
            },
        };
        arguments.push(argument);
    }

    Ok(arguments)
}

fn decode_tensor(node_id: NodeId, value: &Value, shape: &Value, element: Option<String>) -> Result<TensorArg> {
    let (key, device) = decode_identity(node_id, value)?;
    Ok(TensorArg {
        key,
        device,
        shape: decode_shape(node_id, shape)?,
        element,
    })
}

fn decode_tensor_list(
    node_id: NodeId,
    value: &Value,
    shape: &Value,
    descriptor: &TypeDescriptor,
) -> Result<Vec<TensorArg>> {
    let ids = value
        .as_array()
        .ok_or_else(|| Error::malformed(node_id, "tensor list is not an array"))?;
    let shapes = shape
        .as_array()
        .ok_or_else(|| Error::malformed(node_id, "unexpected shape encoding for tensor list"))?;

    if ids.len() != shapes.len() {
        return Err(Error::malformed(
            node_id,
            format!("tensor list has {} ids but {} shapes", ids.len(), shapes.len()),
        ));
    }

    let elements = match descriptor {
        TypeDescriptor::List(elements) => elements.as_slice(),
        _ => &[],
    };

    ids.iter()
        .zip(shapes)
        .enumerate()
        .map(|(i, (id, shape))| {
            let element = elements
                .get(i)
                .or_else(|| elements.first())
                .and_then(|e| e.element())
                .map(str::to_string);
            decode_tensor(node_id, id, shape, element)
        })
        .collect()
}

fn decode_identity(node_id: NodeId, value: &Value) -> Result<(TensorKey, Option<String>)> {
    let parts = value
        .as_array()
        .filter(|parts| parts.len() == 5 || parts.len() == 6)
        .ok_or_else(|| {
            Error::malformed(node_id, format!("unexpected tensor identity encoding: {}", value))
        })?;

    let mut fields = [0u64; 5];
    for (field, part) in fields.iter_mut().zip(parts) {
        *field = part.as_u64().ok_or_else(|| {
            Error::malformed(node_id, format!("non-integer tensor identity field: {}", part))
        })?;
    }

    let device = parts.get(5).map(|d| match d.as_str() {
        Some(text) => text.to_string(),
        None => d.to_string(),
    });

    Ok((TensorKey::new(fields[0], fields[1], fields[2], fields[3], fields[4]), device))
}

fn decode_shape(node_id: NodeId, value: &Value) -> Result<Vec<usize>> {
    let dims = value
        .as_array()
        .ok_or_else(|| Error::malformed(node_id, format!("unexpected shape encoding: {}", value)))?;

    dims.iter()
        .map(|d| {
            d.as_u64().map(|d| d as usize).ok_or_else(|| {
                Error::malformed(node_id, format!("unexpected shape encoding: {}", value))
            })
        })
        .collect()
}
