use std::collections::BTreeSet;

use log::debug;

use super::flatten::Flattened;
use super::identity::{IdentityMap, ReplayTensorId, Role};

/// Classification of tracked replay tensors
///
/// `instantiate` and `produced` partition every tracked id. Ids that are
/// seeded and later also named as an output are kept in `instantiate` and
/// listed again in `seeded_then_produced`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lifetimes {
    pub instantiate: BTreeSet<ReplayTensorId>,
    pub produced: BTreeSet<ReplayTensorId>,
    pub seeded_then_produced: BTreeSet<ReplayTensorId>,
}

impl Lifetimes {
    /// Simulate the replay order and find the tensors consumed before any replayed operator writes them
    pub fn analyze(flattened: &Flattened<'_>, identities: &IdentityMap) -> Self {
        let mut lifetimes = Self::default();
        let mut output_set = BTreeSet::new();

        for planned in &flattened.nodes {
            let node_id = planned.id();
            for tensor in planned.input_tensors() {
                if let Some(id) = identities.lookup(node_id, &tensor.key, Role::Input) {
                    if !output_set.contains(&id) {
                        lifetimes.instantiate.insert(id);
                    }
                }
            }
            for tensor in planned.output_tensors() {
                if let Some(id) = identities.lookup(node_id, &tensor.key, Role::Output) {
                    output_set.insert(id);
                }
            }
        }

        for id in output_set {
            if lifetimes.instantiate.contains(&id) {
                lifetimes.seeded_then_produced.insert(id);
            } else {
                lifetimes.produced.insert(id);
            }
        }

        debug!(
            "{} tensors to instantiate, {} produced by execution",
            lifetimes.instantiate.len(),
            lifetimes.produced.len()
        );
        lifetimes
    }

    pub fn must_instantiate(&self, id: ReplayTensorId) -> bool {
        self.instantiate.contains(&id)
    }

    pub fn is_produced(&self, id: ReplayTensorId) -> bool {
        self.produced.contains(&id)
    }
}
