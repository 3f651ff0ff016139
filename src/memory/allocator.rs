use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::analysis::{PlannedNode, ReplayPlan, ReplayTensorId, Role};
use crate::error::Result;
use crate::ops::{synthesize_tensor, DataType, Device, OperatorFamily, Tensor};
use crate::trace::{NodeId, TensorArg};
use super::registry::PermanentRegistry;

/// Seeded values and the replay policies decided while seeding them
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub registry: PermanentRegistry,
    /// Values fixed at allocation and never rebound by execution
    pub unchangeable: BTreeSet<ReplayTensorId>,
    /// Nodes whose generated inputs replace the default weights with an absent argument
    pub suppress_weights: BTreeSet<NodeId>,
    pub duration: Duration,
}

impl Allocation {
    pub fn is_unchangeable(&self, id: ReplayTensorId) -> bool {
        self.unchangeable.contains(&id)
    }
}

enum Slot {
    Synthesize { shape: Vec<usize>, data_type: DataType },
    Ready(Option<Tensor>),
}

/// Offsets tensor of a gather node, rewritten to a uniform split
struct OffsetsFixup {
    id: ReplayTensorId,
    bags: usize,
    indices: usize,
}

/// Builds the permanent registry from an analyzed trace
pub struct Allocator<'a> {
    device: &'a Device,
    seed: u64,
}

impl<'a> Allocator<'a> {
    pub fn new(device: &'a Device, seed: u64) -> Self {
        Self { device, seed }
    }

    pub fn allocate(&self, plan: &ReplayPlan<'_>) -> Result<Allocation> {
        let start = Instant::now();
        let mut allocation = Allocation {
            registry: PermanentRegistry::new(plan.device_aware),
            ..Allocation::default()
        };
        let mut slots: Vec<(ReplayTensorId, Slot)> = Vec::new();
        let mut claimed = BTreeSet::new();
        let mut fixups = Vec::new();

        for planned in &plan.flattened.nodes {
            self.plan_node(plan, planned, &mut allocation, &mut slots, &mut claimed, &mut fixups)?;
        }

        let (jobs, ready): (Vec<_>, Vec<_>) = slots
            .into_iter()
            .partition(|(_, slot)| matches!(slot, Slot::Synthesize { .. }));

        for (id, slot) in ready {
            if let Slot::Ready(value) = slot {
                allocation.registry.insert(id, value);
            }
        }

        let seed = self.seed;
        let synthesized: Vec<(ReplayTensorId, Tensor)> = jobs
            .into_par_iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Synthesize { shape, data_type } => {
                    let mut rng = StdRng::seed_from_u64(mix_seed(seed, id));
                    Some((id, synthesize_tensor(&shape, data_type, &mut rng)))
                }
                Slot::Ready(_) => None,
            })
            .collect();
        for (id, tensor) in synthesized {
            allocation.registry.insert(id, Some(tensor));
        }

        for fixup in &fixups {
            apply_uniform_offsets(&mut allocation.registry, fixup)?;
        }

        if plan.device_aware {
            for tensor in plan.identities.tensors() {
                let device = tensor.device.as_deref().and_then(|d| d.parse::<Device>().ok());
                if let Some(device) = device {
                    allocation.registry.set_device(tensor.id, device);
                }
            }
        }

        allocation.duration = start.elapsed();
        info!(
            "Allocated {} tensors ({} bytes, {} null), {} unchangeable",
            allocation.registry.len(),
            allocation.registry.size_in_bytes(),
            allocation.registry.null_count(),
            allocation.unchangeable.len()
        );
        Ok(allocation)
    }

    fn plan_node(
        &self,
        plan: &ReplayPlan<'_>,
        planned: &PlannedNode<'_>,
        allocation: &mut Allocation,
        slots: &mut Vec<(ReplayTensorId, Slot)>,
        claimed: &mut BTreeSet<ReplayTensorId>,
        fixups: &mut Vec<OffsetsFixup>,
    ) -> Result<()> {
        let node_id = planned.id();
        let traits = &planned.operator.traits;

        let generated = match &traits.family {
            OperatorFamily::Generated { generator, .. } => {
                let generated = generator.generate(planned.node, self.device)?;
                if generated.suppress_weights {
                    allocation.suppress_weights.insert(node_id);
                }
                Some(generated)
            }
            _ => None,
        };

        for (position, tensor) in planned.input_tensors().enumerate() {
            let id = match plan.identities.lookup(node_id, &tensor.key, Role::Input) {
                Some(id) => id,
                None => continue,
            };
            if claimed.contains(&id)
                || !(traits.family.is_specialized() || plan.lifetimes.must_instantiate(id))
            {
                continue;
            }
            claimed.insert(id);

            let slot = match &generated {
                Some(generated) => {
                    allocation.unchangeable.insert(id);
                    Slot::Ready(generated.tensors.get(position).cloned().flatten())
                }
                None => {
                    if matches!(traits.family, OperatorFamily::IndexedGather { .. }) {
                        allocation.unchangeable.insert(id);
                    }
                    if traits.cpu_inputs.contains(&position) {
                        allocation.registry.mark_cpu(id);
                    }
                    default_slot(node_id, tensor)
                }
            };
            slots.push((id, slot));
        }

        if let OperatorFamily::IndexedGather { indices, offsets } = traits.family {
            let tensors: Vec<&TensorArg> = planned.input_tensors().collect();
            if let (Some(index_arg), Some(offset_arg)) = (tensors.get(indices), tensors.get(offsets)) {
                let bags = offset_arg.shape.first().copied().unwrap_or(0);
                let total = index_arg.shape.first().copied().unwrap_or(0);
                if let Some(id) = plan.identities.lookup(node_id, &offset_arg.key, Role::Input) {
                    if bags > 0 {
                        fixups.push(OffsetsFixup { id, bags, indices: total });
                    }
                }
            }
        }

        if traits.stable_outputs {
            for tensor in planned.output_tensors() {
                if let Some(id) = plan.identities.lookup(node_id, &tensor.key, Role::Output) {
                    if claimed.insert(id) {
                        allocation.unchangeable.insert(id);
                        slots.push((id, default_slot(node_id, tensor)));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Default synthesis from the recorded element type
///
/// Uninitialized tensors are expected to be null and stay silent.
fn default_slot(node_id: NodeId, tensor: &TensorArg) -> Slot {
    let element = tensor.element.as_deref().unwrap_or("");
    match DataType::from_element(element) {
        Ok(data_type) => Slot::Synthesize {
            shape: tensor.shape.clone(),
            data_type,
        },
        Err(e) => {
            if !tensor.is_uninitialized() {
                warn!("{} at node {}, tensor {:?}", e, node_id, tensor.key);
            }
            Slot::Ready(None)
        }
    }
}

fn apply_uniform_offsets(registry: &mut PermanentRegistry, fixup: &OffsetsFixup) -> Result<()> {
    let offsets = match registry.get_mut(fixup.id) {
        Some(tensor) => tensor,
        None => return Ok(()),
    };

    let step = fixup.indices as f64 / fixup.bags as f64;
    for i in 0..fixup.bags.min(offsets.len()) {
        offsets.set_flat(i, (i as f64 * step).trunc() as f32)?;
    }
    debug!("Rewrote {} offsets of tensor {} with step {:.2}", fixup.bags, fixup.id, step);
    Ok(())
}

fn mix_seed(seed: u64, id: ReplayTensorId) -> u64 {
    seed ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
