use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ops::Device;

pub use crate::analysis::SkipPolicy;

/// Options for a replay run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    /// Iterations run before timing starts
    pub warmup_iterations: usize,
    /// Timed iterations
    pub iterations: usize,
    /// Samples per iteration, used for throughput
    pub batch_size: usize,
    /// Target device for replayed tensors
    pub device: Device,
    /// Seed for synthesized tensor values
    pub seed: u64,
    /// Time argument setup and execution of every node
    pub fine_grained_timing: bool,
    /// Record backend memory deltas after every node
    pub profile_memory: bool,
    /// Timed iterations per rolling throughput window
    pub qps_interval: usize,
    pub skip_policy: SkipPolicy,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            warmup_iterations: 5,
            iterations: 30,
            batch_size: 1,
            device: Device::default(),
            seed: 0,
            fine_grained_timing: false,
            profile_memory: false,
            qps_interval: 10,
            skip_policy: SkipPolicy::default(),
        }
    }
}

impl ReplayOptions {
    /// Create a new replay options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let options: Self = serde_json::from_reader(reader)?;
        options.validate()?;
        Ok(options)
    }

    /// Set the number of warmup iterations
    pub fn set_warmup_iterations(mut self, warmup_iterations: usize) -> Self {
        self.warmup_iterations = warmup_iterations;
        self
    }

    /// Set the number of timed iterations
    pub fn set_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn set_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the target device
    pub fn set_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Enable or disable per-node timing
    pub fn enable_fine_grained_timing(mut self, enable: bool) -> Self {
        self.fine_grained_timing = enable;
        self
    }

    /// Enable or disable per-node memory profiling
    pub fn enable_memory_profiling(mut self, enable: bool) -> Self {
        self.profile_memory = enable;
        self
    }

    pub fn set_qps_interval(mut self, qps_interval: usize) -> Self {
        self.qps_interval = qps_interval;
        self
    }

    pub fn set_skip_policy(mut self, skip_policy: SkipPolicy) -> Self {
        self.skip_policy = skip_policy;
        self
    }

    pub fn total_iterations(&self) -> usize {
        self.warmup_iterations + self.iterations
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(Error::InvalidConfig(
                "at least one timed iteration is required".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = ReplayOptions::default();
        assert_eq!(options.warmup_iterations, 5);
        assert_eq!(options.iterations, 30);
        assert_eq!(options.qps_interval, 10);
        assert_eq!(options.device, Device::Cuda(None));
        assert!(options.skip_policy.is_listed("DataLoader#_MultiProcessingDataLoaderIter.__next__"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ReplayOptions::new().set_iterations(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(ReplayOptions::new().set_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"iterations": 3, "device": "cuda:1", "fine_grained_timing": true}}"#).unwrap();

        let options = ReplayOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.iterations, 3);
        assert_eq!(options.warmup_iterations, 5);
        assert_eq!(options.device, Device::Cuda(Some(1)));
        assert!(options.fine_grained_timing);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{"device": "tpu"}}"#).unwrap();
        assert!(ReplayOptions::from_json_file(bad.path()).is_err());
    }
}
