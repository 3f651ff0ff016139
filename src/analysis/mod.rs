pub mod flatten;
pub mod identity;
pub mod lifetime;

use std::time::{Duration, Instant};

use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::ops::OperatorResolver;
use crate::trace::Trace;

pub use flatten::{Flattened, Flattener, PlannedNode, SkipCategory, SkipPolicy, SkipReason, SkipRecord};
pub use identity::{IdentityMap, ReplayTensor, ReplayTensorId, Role};
pub use lifetime::Lifetimes;

/// Tensor bookkeeping statistics of an analyzed trace
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TensorStats {
    /// Identity keys consumed as an operator input
    pub tracked_keys: usize,
    pub replay_tensors: usize,
    pub multi_shape_keys: usize,
    pub must_instantiate: usize,
}

/// Everything the allocator and scheduler need from a trace
#[derive(Debug, Clone)]
pub struct ReplayPlan<'t> {
    pub flattened: Flattened<'t>,
    pub identities: IdentityMap,
    pub lifetimes: Lifetimes,
    /// Tensor identities carry a device tag
    pub device_aware: bool,
    pub duration: Duration,
}

impl<'t> ReplayPlan<'t> {
    pub fn stats(&self) -> TensorStats {
        TensorStats {
            tracked_keys: self.flattened.dependency_counts.len(),
            replay_tensors: self.identities.len(),
            multi_shape_keys: self.identities.multi_shape_keys(),
            must_instantiate: self.lifetimes.instantiate.len(),
        }
    }
}

/// Runs flattening, identity resolution and lifetime analysis in sequence
///
/// Each stage only reads what the previous one produced.
pub struct AnalysisPass<'a> {
    policy: &'a SkipPolicy,
    resolver: &'a dyn OperatorResolver,
}

impl<'a> AnalysisPass<'a> {
    pub fn new(policy: &'a SkipPolicy, resolver: &'a dyn OperatorResolver) -> Self {
        Self { policy, resolver }
    }

    pub fn run<'t>(&self, trace: &'t Trace) -> Result<ReplayPlan<'t>> {
        let start = Instant::now();

        let flattened = Flattener::new(self.policy, self.resolver).flatten(&trace.root)?;
        let identities = IdentityMap::build(&flattened);
        let lifetimes = Lifetimes::analyze(&flattened, &identities);

        let plan = ReplayPlan {
            flattened,
            identities,
            lifetimes,
            device_aware: trace.is_device_aware(),
            duration: start.elapsed(),
        };

        let stats = plan.stats();
        info!(
            "Tensors: {} tracked keys, {} replay tensors ({} keys with multiple shapes), {} to instantiate",
            stats.tracked_keys, stats.replay_tensors, stats.multi_shape_keys, stats.must_instantiate
        );
        Ok(plan)
    }
}
