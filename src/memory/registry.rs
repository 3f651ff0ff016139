use std::collections::{BTreeMap, BTreeSet};

use log::trace;

use crate::analysis::ReplayTensorId;
use crate::error::Result;
use crate::ops::{Device, Tensor};
use super::backend::DeviceBackend;

/// Golden pre-iteration tensor values
///
/// Written once by the allocator and read-only while replaying. A `None`
/// value is a slot whose value could not be synthesized.
#[derive(Debug, Clone, Default)]
pub struct PermanentRegistry {
    values: BTreeMap<ReplayTensorId, Option<Tensor>>,
    /// Recorded device of each replay tensor, for device-aware traces
    devices: BTreeMap<ReplayTensorId, Device>,
    /// Tensors kept on the host when the trace carries no device tags
    cpu_tensors: BTreeSet<ReplayTensorId>,
    device_aware: bool,
}

impl PermanentRegistry {
    pub fn new(device_aware: bool) -> Self {
        Self {
            device_aware,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, id: ReplayTensorId, value: Option<Tensor>) {
        self.values.insert(id, value);
    }

    pub fn contains(&self, id: ReplayTensorId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn get(&self, id: ReplayTensorId) -> Option<&Tensor> {
        self.values.get(&id).and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, id: ReplayTensorId) -> Option<&mut Tensor> {
        self.values.get_mut(&id).and_then(|v| v.as_mut())
    }

    pub fn set_device(&mut self, id: ReplayTensorId, device: Device) {
        self.devices.insert(id, device);
    }

    pub fn mark_cpu(&mut self, id: ReplayTensorId) {
        self.cpu_tensors.insert(id);
    }

    pub fn is_cpu_tensor(&self, id: ReplayTensorId) -> bool {
        self.cpu_tensors.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slots that hold no value
    pub fn null_count(&self) -> usize {
        self.values.values().filter(|v| v.is_none()).count()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.values
            .values()
            .flatten()
            .map(|t| t.size_in_bytes())
            .sum()
    }

    fn stays_on_host(&self, id: ReplayTensorId) -> bool {
        if self.device_aware {
            matches!(self.devices.get(&id), Some(Device::Cpu))
        } else {
            self.cpu_tensors.contains(&id)
        }
    }

    /// Derive the working registry for one iteration
    ///
    /// Values are shared with this registry, so nothing here is mutated and
    /// later writes to the working copy never reach it.
    pub fn acquire<'r>(&self, backend: &'r dyn DeviceBackend, target: &Device) -> Result<WorkingRegistry<'r>> {
        let mut values = BTreeMap::new();
        for (&id, value) in &self.values {
            let placed = match value {
                Some(tensor) if !self.stays_on_host(id) => Some(backend.to_device(tensor, target)?),
                Some(tensor) => Some(tensor.clone()),
                None => None,
            };
            values.insert(id, placed);
        }

        trace!("Working registry acquired with {} entries", values.len());
        Ok(WorkingRegistry { values, backend })
    }
}

/// Per-iteration tensor values
///
/// Lives for exactly one iteration. Dropping it releases every binding and
/// flushes the backend cache.
pub struct WorkingRegistry<'r> {
    values: BTreeMap<ReplayTensorId, Option<Tensor>>,
    backend: &'r dyn DeviceBackend,
}

impl<'r> WorkingRegistry<'r> {
    pub fn get(&self, id: ReplayTensorId) -> Option<&Tensor> {
        self.values.get(&id).and_then(|v| v.as_ref())
    }

    /// Bind an operator output, replacing any earlier value
    pub fn bind(&mut self, id: ReplayTensorId, tensor: Tensor) {
        self.values.insert(id, Some(tensor));
    }

    pub fn contains(&self, id: ReplayTensorId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries in id order
    pub fn entries(&self) -> impl Iterator<Item = (ReplayTensorId, Option<&Tensor>)> {
        self.values.iter().map(|(&id, v)| (id, v.as_ref()))
    }
}

impl<'r> Drop for WorkingRegistry<'r> {
    fn drop(&mut self) {
        self.values.clear();
        self.backend.empty_cache();
    }
}
