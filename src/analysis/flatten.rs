use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ops::{OperatorResolver, Resolution, ResolvedOperator};
use crate::trace::{Argument, NodeId, NodeKind, TensorArg, TensorKey, TraceNode, TypeDescriptor};

/// Which trace nodes are pruned before replay, and how skipped names are bucketed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipPolicy {
    /// A node whose name contains any of these is pruned with its subtree
    pub skip_names: Vec<String>,
    pub fused_markers: Vec<String>,
    pub unsupported_markers: Vec<String>,
    pub standard_markers: Vec<String>,
    pub specialized_markers: Vec<String>,
}

impl Default for SkipPolicy {
    fn default() -> Self {
        let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        Self {
            skip_names: owned(&[
                "DataLoader",
                "aten::set_",
                "fb::",
                "c10d::allreduce_",
                "pyspeech::",
                "All2All_Pooled_Wait",
                "adagrad",
            ]),
            fused_markers: owned(&["fused"]),
            unsupported_markers: owned(&["aten::record_stream", "aten::set_"]),
            standard_markers: owned(&["aten::"]),
            specialized_markers: owned(&["fb::", "fbgemm::"]),
        }
    }
}

impl SkipPolicy {
    /// A policy that prunes nothing
    pub fn empty() -> Self {
        Self {
            skip_names: Vec::new(),
            ..Self::default()
        }
    }

    /// Add a skip-list entry
    pub fn skip(mut self, name: impl Into<String>) -> Self {
        self.skip_names.push(name.into());
        self
    }

    pub fn is_listed(&self, name: &str) -> bool {
        self.skip_names.iter().any(|s| name.contains(s.as_str()))
    }

    /// Bucket a skipped operator name for the coverage report
    pub fn categorize(&self, name: &str) -> SkipCategory {
        let matches = |markers: &[String]| markers.iter().any(|m| name.contains(m.as_str()));

        if matches(&self.fused_markers) {
            SkipCategory::Fused
        } else if matches(&self.unsupported_markers) {
            SkipCategory::Unsupported
        } else if matches(&self.standard_markers) {
            SkipCategory::Standard
        } else if matches(&self.specialized_markers) {
            SkipCategory::Specialized
        } else {
            SkipCategory::Other
        }
    }
}

/// Report bucket of a skipped node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCategory {
    Fused,
    Unsupported,
    Standard,
    Specialized,
    Other,
}

impl fmt::Display for SkipCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SkipCategory::Fused => "fused",
            SkipCategory::Unsupported => "unsupported",
            SkipCategory::Standard => "standard",
            SkipCategory::Specialized => "specialized",
            SkipCategory::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Why a node was not replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Matched the skip list; its subtree was pruned
    Listed,
    /// Qualified, but the resolver has no implementation
    Unresolved,
    /// An operator replayed through its children instead
    Unqualified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub node_id: NodeId,
    pub name: String,
    pub category: SkipCategory,
    pub reason: SkipReason,
}

/// A node selected for replay, with its operator and decoded arguments cached
#[derive(Debug, Clone)]
pub struct PlannedNode<'t> {
    pub node: &'t TraceNode,
    pub operator: ResolvedOperator,
    pub inputs: Vec<Argument>,
    pub outputs: Vec<Argument>,
    /// Output tensors announced by the node's output type strings
    pub declared_outputs: usize,
}

impl<'t> PlannedNode<'t> {
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Input tensors with lists flattened in place
    pub fn input_tensors(&self) -> impl Iterator<Item = &TensorArg> {
        self.inputs.iter().flat_map(|a| a.tensors())
    }

    /// Output tensors with lists flattened in place
    pub fn output_tensors(&self) -> impl Iterator<Item = &TensorArg> {
        self.outputs.iter().flat_map(|a| a.tensors())
    }
}

/// Result of flattening a trace
#[derive(Debug, Clone, Default)]
pub struct Flattened<'t> {
    /// Nodes to replay, strictly increasing by id
    pub nodes: Vec<PlannedNode<'t>>,
    pub skipped: Vec<SkipRecord>,
    /// Number of operator-input occurrences of every consumed key
    pub dependency_counts: BTreeMap<TensorKey, usize>,
}

impl<'t> Flattened<'t> {
    pub fn is_tracked(&self, key: &TensorKey) -> bool {
        self.dependency_counts.contains_key(key)
    }

    /// Replayed nodes over replayed plus skipped nodes
    pub fn coverage(&self) -> f64 {
        let total = self.nodes.len() + self.skipped.len();
        if total == 0 {
            return 0.0;
        }
        self.nodes.len() as f64 / total as f64
    }
}

/// Selects the operators to replay from a trace tree
pub struct Flattener<'a> {
    policy: &'a SkipPolicy,
    resolver: &'a dyn OperatorResolver,
}

impl<'a> Flattener<'a> {
    pub fn new(policy: &'a SkipPolicy, resolver: &'a dyn OperatorResolver) -> Self {
        Self { policy, resolver }
    }

    /// Walk the children of `root` and produce the replay order
    ///
    /// A malformed node aborts the whole pass.
    pub fn flatten<'t>(&self, root: &'t TraceNode) -> Result<Flattened<'t>> {
        let mut result = Flattened::default();
        self.visit_children(root, &mut result)?;

        result.nodes.sort_by_key(|n| n.node.id);
        info!("#Operators to execute: {}", result.nodes.len());
        if !result.skipped.is_empty() {
            debug!("Skipped {} operators", result.skipped.len());
        }
        Ok(result)
    }

    fn visit_children<'t>(&self, parent: &'t TraceNode, result: &mut Flattened<'t>) -> Result<()> {
        for child in &parent.children {
            if self.policy.is_listed(&child.name) {
                trace!("Pruning node {} ({})", child.id, child.name);
                self.record_skip(child, SkipReason::Listed, result);
                continue;
            }

            if self.resolver.qualifies(child) {
                self.select(child, result)?;
            } else {
                if child.kind == NodeKind::Operator {
                    self.record_skip(child, SkipReason::Unqualified, result);
                }
                self.visit_children(child, result)?;
            }
        }
        Ok(())
    }

    fn select<'t>(&self, node: &'t TraceNode, result: &mut Flattened<'t>) -> Result<()> {
        let inputs = node.decode_inputs()?;
        let outputs = node.decode_outputs()?;

        let operator = match self.resolver.resolve(node) {
            Resolution::Resolved(operator) => operator,
            Resolution::Unresolved => {
                debug!("No implementation for node {} ({})", node.id, node.name);
                self.record_skip(node, SkipReason::Unresolved, result);
                return Ok(());
            }
        };

        for tensor in inputs.iter().flat_map(|a| a.tensors()) {
            *result.dependency_counts.entry(tensor.key).or_insert(0) += 1;
        }

        let declared_outputs = node
            .output_descriptors()
            .iter()
            .map(TypeDescriptor::tensor_count)
            .sum();

        trace!("Selected node {} ({})", node.id, node.name);
        result.nodes.push(PlannedNode {
            node,
            operator,
            inputs,
            outputs,
            declared_outputs,
        });
        Ok(())
    }

    fn record_skip(&self, node: &TraceNode, reason: SkipReason, result: &mut Flattened<'_>) {
        result.skipped.push(SkipRecord {
            node_id: node.id,
            name: node.name.clone(),
            category: self.policy.categorize(&node.name),
            reason,
        });
    }
}
