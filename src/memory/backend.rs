use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::error::{Error, Result};
use crate::ops::{Device, Tensor};

/// Device placement and memory accounting used by the replay loop
pub trait DeviceBackend: Send + Sync {
    /// Place a value on `device`
    fn to_device(&self, tensor: &Tensor, device: &Device) -> Result<Tensor>;

    /// Wait for all work issued so far to complete
    fn synchronize(&self) -> Result<()>;

    /// Release cached allocations that are no longer referenced
    fn empty_cache(&self);

    /// Bytes currently held by live values
    fn memory_allocated(&self) -> usize;

    /// Bytes reserved by the backend's caching allocator
    fn memory_reserved(&self) -> usize;

    /// Called for every tensor an operator returns
    ///
    /// Backends that observe their own allocations can ignore it.
    fn record_output(&self, _tensor: &Tensor) {}
}

/// Backend that keeps every value in host memory
///
/// Placement only retags tensors. Bytes moved to a non-host device and bytes
/// returned by operators count as allocated until the next cache flush; the
/// reserved figure is the high-water mark of that count.
#[derive(Debug, Default)]
pub struct HostBackend {
    allocated: AtomicUsize,
    reserved: AtomicUsize,
    memory_limit: Option<usize>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail placements that would push the allocated count past `limit` bytes
    pub fn with_memory_limit(limit: usize) -> Self {
        Self {
            memory_limit: Some(limit),
            ..Self::default()
        }
    }

    fn track(&self, size: usize) -> Result<()> {
        let current = self.allocated.load(Ordering::Relaxed);
        if let Some(limit) = self.memory_limit {
            if current.checked_add(size).map_or(true, |total| total > limit) {
                return Err(Error::Device(format!(
                    "Memory limit of {} bytes exceeded with allocation of {} bytes (current: {})",
                    limit, size, current
                )));
            }
        }

        let total = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.reserved.fetch_max(total, Ordering::Relaxed);
        Ok(())
    }
}

impl DeviceBackend for HostBackend {
    fn to_device(&self, tensor: &Tensor, device: &Device) -> Result<Tensor> {
        if !device.is_cpu() && tensor.device != *device {
            self.track(tensor.size_in_bytes())?;
        }
        Ok(tensor.with_device(device.clone()))
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn empty_cache(&self) {
        let released = self.allocated.swap(0, Ordering::Relaxed);
        trace!("Released {} bytes", released);
    }

    fn memory_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn memory_reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    fn record_output(&self, tensor: &Tensor) {
        // outputs are already materialized, so the limit is not enforced here
        let total = self.allocated.fetch_add(tensor.size_in_bytes(), Ordering::Relaxed)
            + tensor.size_in_bytes();
        self.reserved.fetch_max(total, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::DataType;

    #[test]
    fn test_placement_tracks_bytes() {
        let backend = HostBackend::new();
        let tensor = Tensor::zeros(&[4, 4], DataType::Float32);

        let placed = backend.to_device(&tensor, &Device::Cuda(Some(0))).unwrap();
        assert_eq!(placed.device, Device::Cuda(Some(0)));
        assert!(placed.shares_storage(&tensor));
        assert_eq!(backend.memory_allocated(), 64);

        backend.to_device(&tensor, &Device::Cpu).unwrap();
        assert_eq!(backend.memory_allocated(), 64);

        backend.empty_cache();
        assert_eq!(backend.memory_allocated(), 0);
        assert_eq!(backend.memory_reserved(), 64);
    }

    #[test]
    fn test_memory_limit() {
        let backend = HostBackend::with_memory_limit(100);
        let tensor = Tensor::zeros(&[16], DataType::Float32);
        assert!(backend.to_device(&tensor, &Device::Cuda(None)).is_ok());
        assert!(matches!(
            backend.to_device(&tensor, &Device::Cuda(None)),
            Err(Error::Device(_))
        ));
    }
}
