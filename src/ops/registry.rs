use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::trace::{NodeKind, TraceNode};
use super::tensor::{Device, Tensor};
use super::value::{OpArg, OpValue};

/// Trait for operator implementations invoked during replay
pub trait ReplayOperator: Send + Sync + Debug {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Run the operator on a flat positional argument list
    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>>;
}

/// Inputs synthesized by a specialized generator
#[derive(Debug, Clone, Default)]
pub struct GeneratedInputs {
    /// One entry per input tensor of the node, in flattened order
    pub tensors: Vec<Option<Tensor>>,
    /// Pass an explicit absent argument in place of the default weights
    pub suppress_weights: bool,
}

/// Builds structurally valid inputs for operators that cannot take random tensors
pub trait InputGenerator: Send + Sync + Debug {
    fn generate(&self, node: &TraceNode, device: &Device) -> Result<GeneratedInputs>;
}

/// How an operator's inputs are synthesized and wired
#[derive(Debug, Clone)]
pub enum OperatorFamily {
    Standard,
    /// Gather with an index tensor and an offsets tensor (positions into the
    /// flattened input tensors); offsets are rewritten to a uniform split
    IndexedGather { indices: usize, offsets: usize },
    /// Inputs come from a generator; only `input_positions` are passed to the call
    Generated {
        generator: Arc<dyn InputGenerator>,
        input_positions: Vec<usize>,
    },
}

impl Default for OperatorFamily {
    fn default() -> Self {
        OperatorFamily::Standard
    }
}

impl OperatorFamily {
    pub fn is_specialized(&self) -> bool {
        !matches!(self, OperatorFamily::Standard)
    }
}

/// Per-node quirks, evaluated once when the node is resolved
#[derive(Debug, Clone, Default)]
pub struct OperatorTraits {
    pub family: OperatorFamily,
    /// Outputs are seeded once and never rebound by execution
    pub stable_outputs: bool,
    /// Flattened input tensor positions that must stay host-resident
    pub cpu_inputs: Vec<usize>,
}

/// A resolved operator together with its expected output arity
#[derive(Debug, Clone)]
pub struct ResolvedOperator {
    pub callable: Arc<dyn ReplayOperator>,
    pub output_count: usize,
    pub traits: OperatorTraits,
}

/// Outcome of resolving a trace node
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ResolvedOperator),
    Unresolved,
}

/// Maps trace nodes to callable implementations
pub trait OperatorResolver: Send + Sync {
    /// Whether the node is replayed directly rather than through its children
    fn qualifies(&self, node: &TraceNode) -> bool {
        node.kind == NodeKind::Operator
    }

    fn resolve(&self, node: &TraceNode) -> Resolution;
}

#[derive(Debug, Clone)]
struct Registration {
    operator: Arc<dyn ReplayOperator>,
    traits: OperatorTraits,
    output_count: Option<usize>,
}

/// Name-keyed operator registry
///
/// Exact names are tried first, then substring patterns in registration order.
#[derive(Debug, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Registration>,
    patterns: Vec<(String, Registration)>,
}

impl OperatorRegistry {
    /// Create an empty operator registry
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Register an operator under an exact name
    pub fn register_operator(&mut self, name: &str, operator: Arc<dyn ReplayOperator>) -> Result<()> {
        self.register_with_traits(name, operator, OperatorTraits::default())
    }

    /// Register an operator under an exact name with replay traits
    pub fn register_with_traits(
        &mut self,
        name: &str,
        operator: Arc<dyn ReplayOperator>,
        traits: OperatorTraits,
    ) -> Result<()> {
        if self.operators.contains_key(name) {
            return Err(Error::OperatorError(format!(
                "Operator {} is already registered",
                name
            )));
        }

        self.operators.insert(
            name.to_string(),
            Registration {
                operator,
                traits,
                output_count: None,
            },
        );
        Ok(())
    }

    /// Register an operator for every node whose name contains `pattern`
    pub fn register_pattern(
        &mut self,
        pattern: &str,
        operator: Arc<dyn ReplayOperator>,
        traits: OperatorTraits,
    ) -> Result<()> {
        if self.patterns.iter().any(|(p, _)| p == pattern) {
            return Err(Error::OperatorError(format!(
                "Pattern {} is already registered",
                pattern
            )));
        }

        self.patterns.push((
            pattern.to_string(),
            Registration {
                operator,
                traits,
                output_count: None,
            },
        ));
        Ok(())
    }

    /// Pin the output arity for an exact name instead of using the trace's declared outputs
    pub fn set_output_count(&mut self, name: &str, output_count: usize) -> Result<()> {
        let registration = self
            .operators
            .get_mut(name)
            .ok_or_else(|| Error::OperatorError(format!("Operator {} is not registered", name)))?;
        registration.output_count = Some(output_count);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.operators.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initialize the registry with the builtin host operators
    pub fn initialize_standard_operators() -> Self {
        use super::builtin::{
            Cat, ElementwiseBinary, ElementwiseUnary, EmbeddingBag, MatMul, Passthrough,
        };

        let mut registry = Self::new();
        registry.insert_builtin("aten::add", Arc::new(ElementwiseBinary::add()), OperatorTraits::default());
        registry.insert_builtin("aten::mul", Arc::new(ElementwiseBinary::mul()), OperatorTraits::default());
        registry.insert_builtin("aten::relu", Arc::new(ElementwiseUnary::relu()), OperatorTraits::default());
        registry.insert_builtin("aten::sigmoid", Arc::new(ElementwiseUnary::sigmoid()), OperatorTraits::default());
        registry.insert_builtin("aten::mm", Arc::new(MatMul), OperatorTraits::default());
        registry.insert_builtin("aten::cat", Arc::new(Cat), OperatorTraits::default());
        registry.insert_builtin(
            "aten::embedding_bag",
            Arc::new(EmbeddingBag),
            OperatorTraits {
                family: OperatorFamily::IndexedGather { indices: 1, offsets: 2 },
                ..OperatorTraits::default()
            },
        );
        // pinned host buffers are read from host memory
        registry.insert_builtin(
            "aten::pin_memory",
            Arc::new(Passthrough::new("aten::pin_memory")),
            OperatorTraits {
                cpu_inputs: vec![0],
                ..OperatorTraits::default()
            },
        );
        registry.insert_builtin("aten::to", Arc::new(Passthrough::new("aten::to")), OperatorTraits::default());
        registry.insert_builtin("aten::clone", Arc::new(Passthrough::new("aten::clone")), OperatorTraits::default());

        registry
    }

    fn insert_builtin(&mut self, name: &str, operator: Arc<dyn ReplayOperator>, traits: OperatorTraits) {
        self.operators.insert(
            name.to_string(),
            Registration {
                operator,
                traits,
                output_count: None,
            },
        );
    }

    fn lookup(&self, name: &str) -> Option<&Registration> {
        self.operators.get(name).or_else(|| {
            self.patterns
                .iter()
                .find(|(pattern, _)| name.contains(pattern.as_str()))
                .map(|(_, registration)| registration)
        })
    }
}

impl OperatorResolver for OperatorRegistry {
    fn resolve(&self, node: &TraceNode) -> Resolution {
        match self.lookup(&node.name) {
            Some(registration) => Resolution::Resolved(ResolvedOperator {
                callable: registration.operator.clone(),
                output_count: registration
                    .output_count
                    .unwrap_or_else(|| node.output_types.len()),
                traits: registration.traits.clone(),
            }),
            None => Resolution::Unresolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::builtin::Passthrough;
    use crate::trace::TensorKey;

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = OperatorRegistry::new();
        registry
            .register_operator("custom::op", Arc::new(Passthrough::new("custom::op")))
            .unwrap();
        assert!(registry
            .register_operator("custom::op", Arc::new(Passthrough::new("custom::op")))
            .is_err());
    }

    #[test]
    fn test_resolution_uses_declared_outputs() {
        let registry = OperatorRegistry::initialize_standard_operators();
        let node = TraceNode::operator(1, "aten::relu")
            .input_tensor(TensorKey::new(1, 1, 0, 4, 4), &[4], "float")
            .output_tensor(TensorKey::new(2, 2, 0, 4, 4), &[4], "float");

        match registry.resolve(&node) {
            Resolution::Resolved(resolved) => {
                assert_eq!(resolved.output_count, 1);
                assert_eq!(resolved.callable.name(), "aten::relu");
            }
            Resolution::Unresolved => panic!("aten::relu should resolve"),
        }

        let unknown = TraceNode::operator(2, "aten::unknown_op");
        assert!(matches!(registry.resolve(&unknown), Resolution::Unresolved));
    }

    #[test]
    fn test_pinned_output_count() {
        let mut registry = OperatorRegistry::initialize_standard_operators();
        assert!(registry.set_output_count("custom::missing", 0).is_err());
        registry.set_output_count("aten::relu", 0).unwrap();

        let node = TraceNode::operator(5, "aten::relu")
            .input_tensor(TensorKey::new(1, 1, 0, 4, 4), &[4], "float")
            .output_tensor(TensorKey::new(2, 2, 0, 4, 4), &[4], "float");
        match registry.resolve(&node) {
            Resolution::Resolved(resolved) => assert_eq!(resolved.output_count, 0),
            Resolution::Unresolved => panic!("aten::relu should resolve"),
        }
    }

    #[test]
    fn test_pattern_registration() {
        let mut registry = OperatorRegistry::new();
        registry
            .register_pattern(
                "split_embedding_codegen_lookup",
                Arc::new(Passthrough::new("lookup")),
                OperatorTraits::default(),
            )
            .unwrap();

        let node = TraceNode::operator(3, "fbgemm::split_embedding_codegen_lookup_sgd_function");
        assert!(matches!(registry.resolve(&node), Resolution::Resolved(_)));
    }

    #[test]
    fn test_embedding_bag_is_gather_family() {
        let registry = OperatorRegistry::initialize_standard_operators();
        let node = TraceNode::operator(4, "aten::embedding_bag");
        match registry.resolve(&node) {
            Resolution::Resolved(resolved) => assert!(matches!(
                resolved.traits.family,
                OperatorFamily::IndexedGather { indices: 1, offsets: 2 }
            )),
            Resolution::Unresolved => panic!("aten::embedding_bag should resolve"),
        }
    }
}
