use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use super::node::{NodeId, NodeKind, TraceNode};
use super::types::TypeDescriptor;

/// Node id given to the synthetic root when a trace has several top-level nodes
pub const SYNTHETIC_ROOT_ID: NodeId = 0;

/// A captured execution trace, held as a tree
#[derive(Debug, Clone)]
pub struct Trace {
    pub root: TraceNode,
}

/// Flat node record of the execution-graph JSON format
#[derive(Debug, Deserialize)]
struct FlatNode {
    id: NodeId,
    name: String,
    #[serde(default)]
    parent: Option<NodeId>,
    #[serde(default)]
    kind: Option<NodeKind>,
    #[serde(default)]
    op_schema: String,
    #[serde(default)]
    inputs: Vec<Value>,
    #[serde(default)]
    input_types: Vec<String>,
    #[serde(default)]
    input_shapes: Vec<Value>,
    #[serde(default)]
    outputs: Vec<Value>,
    #[serde(default)]
    output_types: Vec<String>,
    #[serde(default)]
    output_shapes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FlatTrace {
    nodes: Vec<FlatNode>,
}

impl Trace {
    pub fn new(root: TraceNode) -> Self {
        Self { root }
    }

    /// Load a trace from execution-graph JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let flat: FlatTrace = serde_json::from_str(text)?;
        Self::from_flat(flat)
    }

    /// Load a trace from any reader yielding execution-graph JSON
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let flat: FlatTrace = serde_json::from_reader(reader)?;
        Self::from_flat(flat)
    }

    /// Load a trace from an execution-graph JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    fn from_flat(flat: FlatTrace) -> Result<Self> {
        let total = flat.nodes.len();
        let mut nodes: BTreeMap<NodeId, TraceNode> = BTreeMap::new();
        let mut parents: BTreeMap<NodeId, Option<NodeId>> = BTreeMap::new();

        for raw in flat.nodes {
            if nodes.contains_key(&raw.id) {
                return Err(Error::InvalidTrace(format!("duplicate node id {}", raw.id)));
            }

            let kind = raw.kind.unwrap_or(if !raw.op_schema.is_empty() || !raw.outputs.is_empty() {
                NodeKind::Operator
            } else {
                NodeKind::Label
            });

            parents.insert(raw.id, raw.parent.filter(|p| *p != raw.id));
            nodes.insert(
                raw.id,
                TraceNode {
                    id: raw.id,
                    name: raw.name,
                    kind,
                    inputs: raw.inputs,
                    input_types: raw.input_types,
                    input_shapes: raw.input_shapes,
                    outputs: raw.outputs,
                    output_types: raw.output_types,
                    output_shapes: raw.output_shapes,
                    children: Vec::new(),
                },
            );
        }

        let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        let mut roots = Vec::new();
        for (&id, parent) in &parents {
            match parent {
                Some(parent) if nodes.contains_key(parent) => {
                    children.entry(*parent).or_default().push(id)
                }
                _ => roots.push(id),
            }
        }

        let mut built = Vec::with_capacity(roots.len());
        let mut attached = 0usize;
        for id in roots {
            built.push(assemble(id, &mut nodes, &children, &mut attached)?);
        }

        // Anything left over hangs off a parent cycle and is unreachable from a root
        if attached != total {
            return Err(Error::InvalidTrace(format!(
                "{} nodes are unreachable from any root (parent cycle)",
                total - attached
            )));
        }

        let root = if built.len() == 1 {
            built.remove(0)
        } else {
            let mut root = TraceNode::label(SYNTHETIC_ROOT_ID, "[trace root]");
            root.children = built;
            root
        };

        Ok(Self { root })
    }

    /// Number of nodes in the tree, root included
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |_| count += 1);
        count
    }

    /// Look up a node by id
    pub fn find(&self, id: NodeId) -> Option<&TraceNode> {
        let mut found = None;
        self.root.walk(&mut |node| {
            if found.is_none() && node.id == id {
                found = Some(node);
            }
        });
        found
    }

    /// Whether tensor identities carry a trailing device tag
    ///
    /// Decided by the first tensor identity met in depth-first order; a trace
    /// without tensors counts as device-aware.
    pub fn is_device_aware(&self) -> bool {
        let mut decided: Option<bool> = None;
        self.root.walk(&mut |node| {
            if decided.is_some() {
                return;
            }
            let arguments = node
                .inputs
                .iter()
                .zip(&node.input_types)
                .chain(node.outputs.iter().zip(&node.output_types));
            for (value, type_name) in arguments {
                if TypeDescriptor::parse(type_name).is_tensor() {
                    if let Some(parts) = value.as_array() {
                        decided = Some(parts.len() == 6);
                        return;
                    }
                }
            }
        });
        decided.unwrap_or(true)
    }
}

fn assemble(
    id: NodeId,
    nodes: &mut BTreeMap<NodeId, TraceNode>,
    children: &BTreeMap<NodeId, Vec<NodeId>>,
    attached: &mut usize,
) -> Result<TraceNode> {
    let mut node = nodes
        .remove(&id)
        .ok_or_else(|| Error::InvalidTrace(format!("node {} reached twice", id)))?;
    *attached += 1;

    if let Some(child_ids) = children.get(&id) {
        for &child in child_ids {
            node.children.push(assemble(child, nodes, children, attached)?);
        }
    }
    Ok(node)
}
