use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::trace::{NodeId, TensorArg, TensorKey};
use super::flatten::Flattened;

/// Canonical id of a replay tensor, starting at 1
pub type ReplayTensorId = usize;

/// Whether an occurrence is consumed or produced by its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Input,
    Output,
}

/// The unit of tensor reuse during replay: one identity key at one shape
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTensor {
    pub id: ReplayTensorId,
    pub key: TensorKey,
    pub shape: Vec<usize>,
    /// Device of the first occurrence, for device-aware traces
    pub device: Option<String>,
}

/// Mapping from (node, key, role) occurrences to replay tensor ids
///
/// Only keys consumed as an operator input somewhere are tracked. Inside one
/// role of one node, a key is assumed to carry a single shape.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    mapping: HashMap<(NodeId, TensorKey, Role), ReplayTensorId>,
    shapes: BTreeMap<TensorKey, Vec<(ReplayTensorId, Vec<usize>)>>,
    tensors: BTreeMap<ReplayTensorId, ReplayTensor>,
}

impl IdentityMap {
    /// Resolve every tracked tensor occurrence of the flattened nodes, in replay order
    pub fn build(flattened: &Flattened<'_>) -> Self {
        let mut map = Self::default();

        for planned in &flattened.nodes {
            let node_id = planned.id();
            for tensor in planned.input_tensors() {
                if flattened.is_tracked(&tensor.key) {
                    map.resolve(node_id, tensor, Role::Input);
                }
            }
            for tensor in planned.output_tensors() {
                if flattened.is_tracked(&tensor.key) {
                    map.resolve(node_id, tensor, Role::Output);
                }
            }
        }

        debug!(
            "Resolved {} replay tensors for {} tracked keys",
            map.tensors.len(),
            map.shapes.len()
        );
        map
    }

    /// Record one occurrence, minting a new id for an unseen key or an unseen shape of a known key
    pub fn resolve(&mut self, node_id: NodeId, tensor: &TensorArg, role: Role) -> ReplayTensorId {
        let known = self.shapes.get(&tensor.key).and_then(|variants| {
            variants
                .iter()
                .find(|(_, shape)| *shape == tensor.shape)
                .map(|(id, _)| *id)
        });

        let id = match known {
            Some(id) => id,
            None => {
                let id = self.tensors.len() + 1;
                self.tensors.insert(
                    id,
                    ReplayTensor {
                        id,
                        key: tensor.key,
                        shape: tensor.shape.clone(),
                        device: tensor.device.clone(),
                    },
                );
                self.shapes
                    .entry(tensor.key)
                    .or_default()
                    .push((id, tensor.shape.clone()));
                id
            }
        };

        self.mapping.insert((node_id, tensor.key, role), id);
        id
    }

    pub fn lookup(&self, node_id: NodeId, key: &TensorKey, role: Role) -> Option<ReplayTensorId> {
        self.mapping.get(&(node_id, *key, role)).copied()
    }

    pub fn tensor(&self, id: ReplayTensorId) -> Option<&ReplayTensor> {
        self.tensors.get(&id)
    }

    /// All replay tensors in id order
    pub fn tensors(&self) -> impl Iterator<Item = &ReplayTensor> {
        self.tensors.values()
    }

    /// Replay tensor ids minted for a key, in minting order
    pub fn variants(&self, key: &TensorKey) -> Vec<ReplayTensorId> {
        self.shapes
            .get(key)
            .map(|variants| variants.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tracked_keys(&self) -> usize {
        self.shapes.len()
    }

    /// Keys observed with more than one shape
    pub fn multi_shape_keys(&self) -> usize {
        self.shapes.values().filter(|variants| variants.len() > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(id: u64, shape: &[usize]) -> TensorArg {
        TensorArg {
            key: TensorKey::new(id, id, 0, 16, 4),
            device: None,
            shape: shape.to_vec(),
            element: Some("float".to_string()),
        }
    }

    #[test]
    fn test_same_key_same_shape_reuses_id() {
        let mut map = IdentityMap::default();
        let a = map.resolve(1, &arg(10, &[4, 4]), Role::Input);
        let b = map.resolve(2, &arg(10, &[4, 4]), Role::Input);
        assert_eq!(a, b);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_new_shape_mints_new_id() {
        let mut map = IdentityMap::default();
        let a = map.resolve(1, &arg(10, &[16]), Role::Input);
        let b = map.resolve(2, &arg(10, &[4, 4]), Role::Output);
        let c = map.resolve(3, &arg(10, &[16]), Role::Input);

        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(map.variants(&arg(10, &[16]).key), vec![a, b]);
        assert_eq!(map.multi_shape_keys(), 1);
        assert_eq!(map.lookup(2, &arg(10, &[16]).key, Role::Output), Some(b));
        assert_eq!(map.lookup(2, &arg(10, &[16]).key, Role::Input), None);
    }
}
