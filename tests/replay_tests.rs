use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::json;
use trace_replay::analysis::SkipPolicy;
use trace_replay::tools::report::LatencyPercentiles;
use trace_replay::{
    DataType, Device, Error, ExportFormat, GeneratedInputs, HostBackend, InputGenerator, OpArg,
    OpValue, OperatorFamily, OperatorRegistry, OperatorTraits, ReplayEngine, ReplayOperator,
    ReplayOptions, Result, Role, SchedulerState, Tensor, TensorKey, Trace, TraceNode,
};

fn key(id: u64) -> TensorKey {
    TensorKey::new(id, 100 + id, 0, 4, 4)
}

/// Produces a fresh tensor of ones, ignoring its arguments
#[derive(Debug)]
struct Source {
    shape: Vec<usize>,
}

impl ReplayOperator for Source {
    fn name(&self) -> &str {
        "test::source"
    }

    fn invoke(&self, _args: &[OpArg]) -> Result<Vec<OpValue>> {
        Ok(vec![OpValue::Tensor(Tensor::ones(&self.shape, DataType::Float32))])
    }
}

/// Adds one to its first tensor argument
#[derive(Debug)]
struct Increment;

impl ReplayOperator for Increment {
    fn name(&self) -> &str {
        "test::increment"
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let input = args
            .first()
            .and_then(|a| a.tensor())
            .ok_or_else(|| Error::OperatorError("missing input".to_string()))?;
        let data = input.data.mapv(|v| v + 1.0);
        Ok(vec![OpValue::Tensor(Tensor::from_array(data, input.data_type))])
    }
}

/// Records how many arguments each call received
#[derive(Debug, Default)]
struct Recorder {
    calls: Mutex<Vec<Vec<String>>>,
}

impl ReplayOperator for Recorder {
    fn name(&self) -> &str {
        "test::recorder"
    }

    fn invoke(&self, args: &[OpArg]) -> Result<Vec<OpValue>> {
        let described = args.iter().map(|a| a.describe()).collect();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(described);
        }
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct FixedLookupInputs;

impl InputGenerator for FixedLookupInputs {
    fn generate(&self, node: &TraceNode, device: &Device) -> Result<GeneratedInputs> {
        let tensors = node
            .input_tensors()?
            .iter()
            .map(|t| Some(Tensor::zeros(&t.shape, DataType::Float32).with_device(device.clone())))
            .collect();
        Ok(GeneratedInputs {
            tensors,
            suppress_weights: true,
        })
    }
}

fn host_options() -> ReplayOptions {
    ReplayOptions::new()
        .set_warmup_iterations(2)
        .set_iterations(5)
        .set_device(Device::Cpu)
        .set_skip_policy(SkipPolicy::empty())
}

fn chain_trace() -> Trace {
    Trace::new(
        TraceNode::label(0, "root")
            .child(TraceNode::operator(1, "test::source").output_tensor(key(1), &[4], "float"))
            .child(
                TraceNode::operator(2, "test::increment")
                    .input_tensor(key(1), &[4], "float")
                    .output_tensor(key(2), &[4], "float"),
            )
            .child(
                TraceNode::operator(3, "test::increment")
                    .input_tensor(key(2), &[4], "float")
                    .output_tensor(key(3), &[4], "float"),
            ),
    )
}

fn chain_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    registry
        .register_operator("test::source", Arc::new(Source { shape: vec![4] }))
        .unwrap();
    registry
        .register_operator("test::increment", Arc::new(Increment))
        .unwrap();
    registry
}

#[test]
fn test_chain_replay_has_full_coverage() -> Result<()> {
    let trace = chain_trace();
    let mut engine = ReplayEngine::new(&trace, host_options())?.with_resolver(Arc::new(chain_registry()));

    let report = engine.run()?;
    assert_eq!(engine.state(), SchedulerState::Done);
    assert_eq!(report.replayed_operators, 3);
    assert_eq!(report.skipped.total, 0);
    assert!((report.coverage - 1.0).abs() < f64::EPSILON);
    assert_eq!(report.tensors.must_instantiate, 0);
    assert_eq!(report.warmup_iterations, 2);
    assert!(report.mean_iteration_ms >= 0.0);

    let json: serde_json::Value = serde_json::from_slice(&report.export(ExportFormat::Json)?)?;
    assert_eq!(json["replayed_operators"], 3);
    assert_eq!(json["coverage"], 1.0);
    Ok(())
}

#[test]
fn test_outputs_flow_through_the_chain() -> Result<()> {
    let trace = chain_trace();
    let mut engine = ReplayEngine::new(&trace, host_options())?.with_resolver(Arc::new(chain_registry()));
    engine.prepare()?;

    let mut registry = engine.acquire_registry()?;
    engine.execute_iteration(&mut registry)?;

    let prepared = engine.prepared().expect("prepared");
    let second = prepared.plan.identities.lookup(3, &key(2), Role::Input).expect("tracked");
    assert_eq!(registry.get(second).map(|t| t.to_vec()), Some(vec![2.0; 4]));
    Ok(())
}

#[test]
fn test_registry_reset_is_idempotent() -> Result<()> {
    let trace = Trace::new(
        TraceNode::label(0, "root").child(
            TraceNode::operator(1, "test::increment")
                .input_tensor(key(1), &[4], "float")
                .output_tensor(key(1), &[4], "float"),
        ),
    );
    let mut engine = ReplayEngine::new(&trace, host_options())?.with_resolver(Arc::new(chain_registry()));
    engine.prepare()?;

    let snapshot = |engine: &ReplayEngine<'_>| -> Result<Vec<(usize, Option<Vec<f32>>)>> {
        let registry = engine.acquire_registry()?;
        Ok(registry.entries().map(|(id, t)| (id, t.map(|t| t.to_vec()))).collect())
    };

    let before = snapshot(&engine)?;
    for _ in 0..3 {
        let mut registry = engine.acquire_registry()?;
        engine.execute_iteration(&mut registry)?;
    }
    let after = snapshot(&engine)?;

    assert_eq!(before.len(), 1);
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn test_stable_outputs_keep_their_seed() -> Result<()> {
    let trace = Trace::new(
        TraceNode::label(0, "root")
            .child(
                TraceNode::operator(1, "test::stable")
                    .input_tensor(key(1), &[4], "float")
                    .output_tensor(key(2), &[4], "float"),
            )
            .child(
                TraceNode::operator(2, "test::increment")
                    .input_tensor(key(2), &[4], "float")
                    .output_tensor(key(3), &[4], "float"),
            )
            .child(TraceNode::operator(3, "test::increment").input_tensor(key(3), &[4], "float")),
    );
    let mut registry = chain_registry();
    registry.register_with_traits(
        "test::stable",
        Arc::new(Increment),
        OperatorTraits {
            stable_outputs: true,
            ..OperatorTraits::default()
        },
    )?;
    let mut engine = ReplayEngine::new(&trace, host_options())?.with_resolver(Arc::new(registry));
    engine.prepare()?;

    let prepared = engine.prepared().expect("prepared");
    let stable = prepared.plan.identities.lookup(2, &key(2), Role::Input).expect("tracked");
    assert!(prepared.allocation.is_unchangeable(stable));
    let seed = prepared.allocation.registry.get(stable).cloned().expect("seeded");

    let mut working = engine.acquire_registry()?;
    for _ in 0..4 {
        engine.execute_iteration(&mut working)?;
    }
    assert_eq!(working.get(stable), Some(&seed));

    let downstream = prepared.plan.identities.lookup(3, &key(3), Role::Input).expect("tracked");
    let expected: Vec<f32> = seed.to_vec().iter().map(|v| v + 1.0).collect();
    assert_eq!(working.get(downstream).map(|t| t.to_vec()), Some(expected));
    Ok(())
}

#[test]
fn test_generated_inputs_replace_weights() -> Result<()> {
    let trace = Trace::new(
        TraceNode::label(0, "root").child(
            TraceNode::operator(1, "fbgemm::split_embedding_codegen_lookup_function")
                .input_tensor(key(1), &[64], "float")
                .input_scalar(json!(2), "Int")
                .input_tensor(key(2), &[8], "long")
                .input_tensor(key(3), &[3], "long"),
        ),
    );
    let recorder = Arc::new(Recorder::default());
    let mut registry = OperatorRegistry::new();
    registry.register_pattern(
        "split_embedding_codegen_lookup",
        recorder.clone(),
        OperatorTraits {
            family: OperatorFamily::Generated {
                generator: Arc::new(FixedLookupInputs),
                input_positions: vec![0, 2, 3],
            },
            ..OperatorTraits::default()
        },
    )?;

    let options = host_options().set_warmup_iterations(0).set_iterations(2);
    let mut engine = ReplayEngine::new(&trace, options)?.with_resolver(Arc::new(registry));
    engine.run()?;

    let prepared = engine.prepared().expect("prepared");
    assert_eq!(prepared.allocation.unchangeable.len(), 3);
    assert!(prepared.allocation.suppress_weights.contains(&1));

    let calls = recorder.calls.lock().expect("lock");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec!["Tensor[64]", "Tensor[8]", "Tensor[3]", "None"]);
    Ok(())
}

#[test]
fn test_host_resident_inputs_stay_on_cpu() -> Result<()> {
    let trace = Trace::new(
        TraceNode::label(0, "root")
            .child(
                TraceNode::operator(1, "aten::pin_memory")
                    .input_tensor(key(1), &[4], "float")
                    .output_tensor(key(2), &[4], "float"),
            )
            .child(
                TraceNode::operator(2, "aten::to")
                    .input_tensor(key(2), &[4], "float")
                    .input_scalar(json!("cuda:0"), "Device")
                    .output_tensor(key(3), &[4], "float"),
            )
            .child(TraceNode::operator(3, "aten::relu").input_tensor(key(3), &[4], "float")),
    );
    let options = host_options().set_device(Device::Cuda(Some(2)));
    let mut engine = ReplayEngine::new(&trace, options)?.with_backend(Arc::new(HostBackend::new()));
    engine.prepare()?;

    let prepared = engine.prepared().expect("prepared");
    let pinned = prepared.plan.identities.lookup(1, &key(1), Role::Input).expect("tracked");
    let moved = prepared.plan.identities.lookup(3, &key(3), Role::Input).expect("tracked");

    let mut working = engine.acquire_registry()?;
    assert_eq!(working.get(pinned).map(|t| t.device.clone()), Some(Device::Cpu));
    engine.execute_iteration(&mut working)?;
    // the device argument of aten::to is redirected to the replay device
    assert_eq!(working.get(moved).map(|t| t.device.clone()), Some(Device::Cuda(Some(2))));
    Ok(())
}

#[test]
fn test_fine_grained_percentiles_match_median() -> Result<()> {
    let trace = chain_trace();
    let options = host_options().enable_fine_grained_timing(true);
    let mut engine = ReplayEngine::new(&trace, options)?.with_resolver(Arc::new(chain_registry()));
    let report = engine.run()?;

    let latency = report.latency.expect("fine-grained timing");
    // two tensor lookups per timed iteration
    assert_eq!(latency.lookup_count, 2 * 5);
    assert!(latency.exec_percentiles.p50 <= latency.exec_percentiles.p90);
    assert!(latency.exec_percentiles.p90 <= latency.exec_percentiles.p95);

    let samples = [4.0, 1.0, 3.0, 10.0, 2.0, 7.0];
    let percentiles = LatencyPercentiles::from_samples(&samples);
    assert!((percentiles.p50 - statistical::median(&samples)).abs() < 1e-9);
    Ok(())
}

#[test]
fn test_options_file_drives_replay() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{"warmup_iterations": 0, "iterations": 3, "device": "cpu", "profile_memory": true,
            "skip_policy": {{"skip_names": ["test::source"]}}}}"#
    )?;
    let options = ReplayOptions::from_json_file(file.path())?;

    let trace = chain_trace();
    let mut engine = ReplayEngine::new(&trace, options)?.with_resolver(Arc::new(chain_registry()));
    let report = engine.run()?;

    assert_eq!(report.replayed_operators, 2);
    assert_eq!(report.skipped.total, 1);
    assert_eq!(report.timed_iterations, 3);
    assert_eq!(report.tensors.must_instantiate, 1);
    assert_eq!(report.memory.as_ref().map(|m| m.by_allocated.len()), Some(2));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("reports").join("memory.csv");
    report.write_to(&path, ExportFormat::Csv)?;
    let text = std::fs::read_to_string(&path)?;
    assert!(text.starts_with("node_id,name,allocated_delta,reserved_delta"));
    assert_eq!(text.lines().count(), 3);
    Ok(())
}
