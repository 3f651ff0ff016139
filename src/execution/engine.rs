use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace};
use serde_json::Value;

use crate::analysis::{AnalysisPass, PlannedNode, ReplayPlan, Role};
use crate::error::{Error, Result};
use crate::memory::{Allocation, Allocator, DeviceBackend, HostBackend, WorkingRegistry};
use crate::ops::{
    describe_args, flatten_outputs, Device, OpArg, OperatorFamily, OperatorRegistry,
    OperatorResolver,
};
use crate::tools::report::{
    LatencyPercentiles, MemoryBreakdown, NodeMemory, NodeTiming, ReplayReport, SkipSummary,
};
use crate::trace::{Argument, NodeId, TensorArg, Trace};

use super::context::ReplayOptions;

/// Observable progress of the replay loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running { iteration: usize },
    IterationComplete { iteration: usize },
    Done,
    /// A node or the backend failed during this iteration
    Aborted { iteration: usize },
}

/// Analysis and allocation results, computed once per engine
#[derive(Debug)]
pub struct Prepared<'t> {
    pub plan: ReplayPlan<'t>,
    pub allocation: Allocation,
    pub duration: Duration,
}

/// Per-node timing accumulated over timed iterations
#[derive(Debug, Default)]
struct NodeMetrics {
    lookups: usize,
    setup: Duration,
    exec: Duration,
    exec_samples_us: Vec<f64>,
}

/// Per-node memory deltas from the last timed iteration
#[derive(Debug, Default)]
struct MemoryMetrics {
    allocated: usize,
    reserved: usize,
    deltas: BTreeMap<NodeId, NodeMemory>,
}

/// Replays a captured trace for a number of timed iterations
pub struct ReplayEngine<'t> {
    trace: &'t Trace,
    options: ReplayOptions,
    resolver: Arc<dyn OperatorResolver>,
    backend: Arc<dyn DeviceBackend>,
    prepared: Option<Prepared<'t>>,
    state: Cell<SchedulerState>,
}

impl<'t> ReplayEngine<'t> {
    /// Create an engine with the builtin operators and the host backend
    pub fn new(trace: &'t Trace, options: ReplayOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            trace,
            options,
            resolver: Arc::new(OperatorRegistry::initialize_standard_operators()),
            backend: Arc::new(HostBackend::new()),
            prepared: None,
            state: Cell::new(SchedulerState::Idle),
        })
    }

    /// Use a different operator resolver; clears any previous preparation
    pub fn with_resolver(mut self, resolver: Arc<dyn OperatorResolver>) -> Self {
        self.resolver = resolver;
        self.prepared = None;
        self
    }

    /// Use a different device backend
    pub fn with_backend(mut self, backend: Arc<dyn DeviceBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.options
    }

    pub fn state(&self) -> SchedulerState {
        self.state.get()
    }

    pub fn prepared(&self) -> Option<&Prepared<'t>> {
        self.prepared.as_ref()
    }

    /// Analyze the trace and build the permanent registry
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared.is_some() {
            return Ok(());
        }

        let start = Instant::now();
        let plan = AnalysisPass::new(&self.options.skip_policy, self.resolver.as_ref()).run(self.trace)?;
        let allocation = Allocator::new(&self.options.device, self.options.seed).allocate(&plan)?;

        self.prepared = Some(Prepared {
            plan,
            allocation,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Derive a fresh working registry from the permanent one
    pub fn acquire_registry(&self) -> Result<WorkingRegistry<'_>> {
        self.require_prepared()?
            .allocation
            .registry
            .acquire(self.backend.as_ref(), &self.options.device)
    }

    /// Run every planned node once against `registry`
    pub fn execute_iteration(&self, registry: &mut WorkingRegistry<'_>) -> Result<()> {
        let prepared = self.require_prepared()?;
        self.run_pass(prepared, registry, None, None)
    }

    /// Prepare if needed, then run warmup and timed iterations
    pub fn run(&mut self) -> Result<ReplayReport> {
        self.prepare()?;
        self.replay()
    }

    fn require_prepared(&self) -> Result<&Prepared<'t>> {
        self.prepared
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("the engine must be prepared before replaying".to_string()))
    }

    fn replay(&self) -> Result<ReplayReport> {
        let prepared = self.require_prepared()?;
        let options = &self.options;
        let warmup = options.warmup_iterations;

        let mut metrics = options.fine_grained_timing.then(NodeMetrics::default);
        let mut memory = options.profile_memory.then(MemoryMetrics::default);
        let mut total_time = Duration::ZERO;
        let mut window_start: Option<Instant> = None;
        let mut last_qps = None;

        info!(
            "Start to execute {} operators for {} warmup and {} timed iterations",
            prepared.plan.flattened.nodes.len(),
            warmup,
            options.iterations
        );

        for iteration in 0..options.total_iterations() {
            let timed = iteration >= warmup;
            let mut registry = match self.acquire_registry() {
                Ok(registry) => registry,
                Err(err) => {
                    self.state.set(SchedulerState::Aborted { iteration });
                    return Err(err);
                }
            };
            if let Some(memory) = memory.as_mut() {
                memory.allocated = self.backend.memory_allocated();
                memory.reserved = self.backend.memory_reserved();
            }
            if timed && window_start.is_none() {
                window_start = Some(Instant::now());
            }

            self.state.set(SchedulerState::Running { iteration });
            let start = Instant::now();
            let pass = self.run_pass(
                prepared,
                &mut registry,
                metrics.as_mut().filter(|_| timed),
                memory.as_mut().filter(|_| timed),
            );
            if let Err(err) = pass {
                self.state.set(SchedulerState::Aborted { iteration });
                return Err(err);
            }
            let elapsed = start.elapsed();
            drop(registry);
            self.state.set(SchedulerState::IterationComplete { iteration });

            if timed {
                total_time += elapsed;
                let completed = iteration - warmup + 1;
                if options.qps_interval > 0 && completed % options.qps_interval == 0 {
                    if let Some(window) = window_start.take() {
                        let seconds = window.elapsed().as_secs_f64();
                        if seconds > 0.0 {
                            let qps = (options.batch_size * options.qps_interval) as f64 / seconds;
                            info!("Current QPS: {:.0}", qps);
                            last_qps = Some(qps);
                        }
                    }
                }
            }
            trace!("Iteration {} took {:?}", iteration, elapsed);
        }

        self.state.set(SchedulerState::Done);
        let mean_iteration_ms = total_time.as_secs_f64() * 1000.0 / options.iterations as f64;
        info!("Execution finished, mean iteration time {:.3} ms", mean_iteration_ms);

        Ok(ReplayReport {
            replayed_operators: prepared.plan.flattened.nodes.len(),
            skipped: SkipSummary::from_records(&prepared.plan.flattened.skipped),
            coverage: prepared.plan.flattened.coverage(),
            warmup_iterations: warmup,
            timed_iterations: options.iterations,
            mean_iteration_ms,
            total_time_ms: total_time.as_secs_f64() * 1000.0,
            last_qps,
            tensors: prepared.plan.stats(),
            preprocess_ms: prepared.duration.as_secs_f64() * 1000.0,
            latency: metrics.map(|m| NodeTiming {
                lookup_count: m.lookups,
                total_setup_us: m.setup.as_secs_f64() * 1e6,
                total_exec_us: m.exec.as_secs_f64() * 1e6,
                exec_percentiles: LatencyPercentiles::from_samples(&m.exec_samples_us),
            }),
            memory: memory.map(|m| MemoryBreakdown::from_deltas(m.deltas.into_values().collect())),
        })
    }

    fn run_pass(
        &self,
        prepared: &Prepared<'t>,
        registry: &mut WorkingRegistry<'_>,
        mut metrics: Option<&mut NodeMetrics>,
        mut memory: Option<&mut MemoryMetrics>,
    ) -> Result<()> {
        for planned in &prepared.plan.flattened.nodes {
            self.run_node(prepared, planned, registry, metrics.as_deref_mut())?;
            if let Some(memory) = memory.as_deref_mut() {
                self.record_memory(planned, memory);
            }
        }
        self.backend.synchronize()
    }

    fn run_node(
        &self,
        prepared: &Prepared<'t>,
        planned: &PlannedNode<'t>,
        registry: &mut WorkingRegistry<'_>,
        metrics: Option<&mut NodeMetrics>,
    ) -> Result<()> {
        let node_start = Instant::now();
        let mut lookups = 0;
        let args = self.resolve_arguments(prepared, planned, registry, &mut lookups);

        let operator = &planned.operator;
        let exec_start = Instant::now();
        let result = operator.callable.invoke(&args);
        let exec_time = exec_start.elapsed();

        let values = result.map_err(|e| Error::Execution {
            node_id: planned.id(),
            operator: operator.callable.name().to_string(),
            message: e.to_string(),
            arguments: describe_args(&args),
        })?;

        if operator.output_count > 0 {
            let outputs = flatten_outputs(values);
            if outputs.len() != planned.declared_outputs {
                return Err(Error::Execution {
                    node_id: planned.id(),
                    operator: operator.callable.name().to_string(),
                    message: format!(
                        "returned {} output tensors, the trace declares {}",
                        outputs.len(),
                        planned.declared_outputs
                    ),
                    arguments: describe_args(&args),
                });
            }
            for tensor in &outputs {
                self.backend.record_output(tensor);
            }
            for (arg, output) in planned.output_tensors().zip(outputs) {
                let id = match prepared.plan.identities.lookup(planned.id(), &arg.key, Role::Output) {
                    Some(id) => id,
                    None => continue,
                };
                if prepared.allocation.is_unchangeable(id) || prepared.plan.lifetimes.must_instantiate(id) {
                    continue;
                }
                registry.bind(id, output);
            }
        }

        if let Some(metrics) = metrics {
            let total = node_start.elapsed();
            metrics.lookups += lookups;
            metrics.exec += exec_time;
            metrics.setup += total.saturating_sub(exec_time);
            metrics.exec_samples_us.push(exec_time.as_secs_f64() * 1e6);
        }
        Ok(())
    }

    fn resolve_arguments(
        &self,
        prepared: &Prepared<'t>,
        planned: &PlannedNode<'t>,
        registry: &WorkingRegistry<'_>,
        lookups: &mut usize,
    ) -> Vec<OpArg> {
        let mut lookup = |tensor: &TensorArg| {
            *lookups += 1;
            prepared
                .plan
                .identities
                .lookup(planned.id(), &tensor.key, Role::Input)
                .and_then(|id| registry.get(id))
                .cloned()
        };

        let mut convert = |argument: &Argument| match argument {
            Argument::Tensor(tensor) => OpArg::Tensor(lookup(tensor)),
            Argument::TensorList(tensors) => OpArg::TensorList(tensors.iter().map(&mut lookup).collect()),
            Argument::Absent => OpArg::Absent,
            Argument::Device(device) if device.contains("cuda") => OpArg::Device(self.options.device.clone()),
            Argument::Device(device) => match device.parse::<Device>() {
                Ok(device) => OpArg::Device(device),
                Err(_) => OpArg::Scalar(Value::String(device.clone())),
            },
            Argument::Float(value) => OpArg::Float(*value),
            Argument::Scalar(value) => OpArg::Scalar(value.clone()),
        };

        match &planned.operator.traits.family {
            OperatorFamily::Generated { input_positions, .. } => {
                let mut args: Vec<OpArg> = input_positions
                    .iter()
                    .filter_map(|&position| planned.inputs.get(position))
                    .map(&mut convert)
                    .collect();
                if prepared.allocation.suppress_weights.contains(&planned.id()) {
                    args.push(OpArg::Absent);
                }
                args
            }
            _ => planned.inputs.iter().map(convert).collect(),
        }
    }

    fn record_memory(&self, planned: &PlannedNode<'t>, memory: &mut MemoryMetrics) {
        let allocated = self.backend.memory_allocated();
        let reserved = self.backend.memory_reserved();
        let delta = NodeMemory {
            node_id: planned.id(),
            name: planned.name().to_string(),
            allocated_delta: allocated as i64 - memory.allocated as i64,
            reserved_delta: reserved as i64 - memory.reserved as i64,
        };
        debug!(
            "Node {} allocated {:+} B, reserved {:+} B",
            delta.node_id, delta.allocated_delta, delta.reserved_delta
        );
        memory.allocated = allocated;
        memory.reserved = reserved;
        memory.deltas.insert(planned.id(), delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SkipPolicy;
    use crate::ops::DataType;
    use crate::trace::{TensorKey, TraceNode};

    fn key(id: u64) -> TensorKey {
        TensorKey::new(id, id, 0, 4, 4)
    }

    fn chain() -> Trace {
        Trace::new(
            TraceNode::label(0, "root")
                .child(
                    TraceNode::operator(1, "aten::relu")
                        .input_tensor(key(1), &[4], "float")
                        .output_tensor(key(2), &[4], "float"),
                )
                .child(
                    TraceNode::operator(2, "aten::sigmoid")
                        .input_tensor(key(2), &[4], "float")
                        .output_tensor(key(3), &[4], "float"),
                )
                .child(
                    TraceNode::operator(3, "aten::add")
                        .input_tensor(key(3), &[4], "float")
                        .input_tensor(key(1), &[4], "float")
                        .input_scalar(serde_json::json!(1), "Int")
                        .output_tensor(key(4), &[4], "float"),
                ),
        )
    }

    fn options() -> ReplayOptions {
        ReplayOptions::new()
            .set_warmup_iterations(1)
            .set_iterations(4)
            .set_qps_interval(2)
            .set_device(Device::Cpu)
            .set_skip_policy(SkipPolicy::default())
    }

    #[test]
    fn test_run_reports_and_finishes() {
        let trace = chain();
        let mut engine = ReplayEngine::new(&trace, options().enable_fine_grained_timing(true)).unwrap();
        assert_eq!(engine.state(), SchedulerState::Idle);

        let report = engine.run().unwrap();
        assert_eq!(engine.state(), SchedulerState::Done);
        assert_eq!(report.replayed_operators, 3);
        assert_eq!(report.timed_iterations, 4);
        assert!((report.coverage - 1.0).abs() < f64::EPSILON);
        assert!(report.last_qps.is_some());

        let latency = report.latency.unwrap();
        // four tensor lookups per timed iteration
        assert_eq!(latency.lookup_count, 4 * 4);
    }

    #[test]
    fn test_outputs_are_bound_in_working_registry() {
        let trace = chain();
        let mut engine = ReplayEngine::new(&trace, options()).unwrap();
        engine.prepare().unwrap();

        let prepared = engine.prepared().unwrap();
        let produced = prepared.plan.identities.lookup(2, &key(2), Role::Input).unwrap();
        let seeded = prepared.plan.identities.lookup(1, &key(1), Role::Input).unwrap();

        let mut registry = engine.acquire_registry().unwrap();
        assert!(registry.get(produced).is_none());
        engine.execute_iteration(&mut registry).unwrap();

        let relu = registry.get(produced).unwrap();
        assert!(relu.to_vec().iter().all(|&v| v >= 0.0));
        assert_eq!(registry.get(seeded), prepared.allocation.registry.get(seeded));
    }

    #[test]
    fn test_operator_failure_is_fatal() {
        let trace = Trace::new(
            TraceNode::label(0, "root").child(
                TraceNode::operator(9, "aten::mm")
                    .input_tensor(key(1), &[2, 3], "float")
                    .input_tensor(key(2), &[2, 3], "float")
                    .output_tensor(key(3), &[2, 3], "float"),
            ),
        );
        let mut engine = ReplayEngine::new(&trace, options()).unwrap();
        match engine.run() {
            Err(Error::Execution { node_id, operator, .. }) => {
                assert_eq!(node_id, 9);
                assert_eq!(operator, "aten::mm");
            }
            other => panic!("expected an execution error, got {:?}", other.map(|r| r.replayed_operators)),
        }
        // the first warmup iteration fails
        assert_eq!(engine.state(), SchedulerState::Aborted { iteration: 0 });
    }

    #[test]
    fn test_output_arity_mismatch_is_fatal() {
        let trace = Trace::new(
            TraceNode::label(0, "root").child(
                TraceNode::operator(4, "aten::relu")
                    .input_tensor(key(1), &[4], "float")
                    .output_tensor(key(2), &[4], "float")
                    .output_tensor(key(3), &[4], "float"),
            ),
        );
        let mut engine = ReplayEngine::new(&trace, options()).unwrap();
        match engine.run() {
            Err(Error::Execution { node_id, message, .. }) => {
                assert_eq!(node_id, 4);
                assert!(message.contains("returned 1 output tensors, the trace declares 2"));
            }
            other => panic!("expected an execution error, got {:?}", other.map(|r| r.replayed_operators)),
        }
        assert_eq!(engine.state(), SchedulerState::Aborted { iteration: 0 });
    }

    #[test]
    fn test_infinite_scalar_reaches_operator() {
        let trace = Trace::new(
            TraceNode::label(0, "root")
                .child(
                    TraceNode::operator(1, "aten::mul")
                        .input_tensor(key(1), &[4], "float")
                        .input_scalar(serde_json::json!("inf"), "Double")
                        .output_tensor(key(2), &[4], "float"),
                )
                .child(TraceNode::operator(2, "aten::relu").input_tensor(key(2), &[4], "float")),
        );
        let mut engine = ReplayEngine::new(&trace, options()).unwrap();
        engine.prepare().unwrap();

        let mut registry = engine.acquire_registry().unwrap();
        engine.execute_iteration(&mut registry).unwrap();

        let prepared = engine.prepared().unwrap();
        let product = prepared.plan.identities.lookup(2, &key(2), Role::Input).unwrap();
        assert!(registry.get(product).unwrap().to_vec().iter().all(|v| v.is_infinite()));
    }

    #[test]
    fn test_memory_profile_lists_nodes() {
        let trace = chain();
        let mut engine = ReplayEngine::new(
            &trace,
            options().enable_memory_profiling(true).set_device(Device::Cuda(None)),
        )
        .unwrap();
        let report = engine.run().unwrap();

        let memory = report.memory.unwrap();
        assert_eq!(memory.by_allocated.len(), 3);
        // each node returns one float tensor of four elements
        assert!(memory.by_allocated.iter().all(|n| n.allocated_delta == 16));
        assert_eq!(DataType::Float32.size_in_bytes() * 4, 16);
    }
}
