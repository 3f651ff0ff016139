// End-of-run replay report and its export formats

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::analysis::{SkipCategory, SkipRecord, TensorStats};
use crate::error::Result;
use crate::trace::NodeId;

/// Nodes listed in the memory breakdown
pub const MEMORY_BREAKDOWN_LIMIT: usize = 100;

/// Output format for report export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Full report as pretty JSON
    Json,
    /// Per-node memory deltas
    Csv,
    /// Human-readable summary
    Text,
}

/// Skipped operators, aggregated
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkipSummary {
    pub total: usize,
    pub by_category: BTreeMap<SkipCategory, usize>,
    pub names: Vec<String>,
}

impl SkipSummary {
    pub fn from_records(records: &[SkipRecord]) -> Self {
        let mut by_category = BTreeMap::new();
        for record in records {
            *by_category.entry(record.category).or_insert(0) += 1;
        }
        Self {
            total: records.len(),
            by_category,
            names: records.iter().map(|r| r.name.clone()).collect(),
        }
    }

    pub fn count(&self, category: SkipCategory) -> usize {
        self.by_category.get(&category).copied().unwrap_or(0)
    }
}

/// Execution-time percentiles in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
}

impl LatencyPercentiles {
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self {
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
        }
    }
}

/// Per-node timing collected over the timed iterations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeTiming {
    /// Tensor lookups in the working registry
    pub lookup_count: usize,
    pub total_setup_us: f64,
    pub total_exec_us: f64,
    pub exec_percentiles: LatencyPercentiles,
}

/// Backend memory change observed after one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMemory {
    pub node_id: NodeId,
    pub name: String,
    pub allocated_delta: i64,
    pub reserved_delta: i64,
}

/// Largest per-node memory deltas, ranked separately for allocated and reserved bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryBreakdown {
    pub by_allocated: Vec<NodeMemory>,
    pub by_reserved: Vec<NodeMemory>,
}

impl MemoryBreakdown {
    pub fn from_deltas(nodes: Vec<NodeMemory>) -> Self {
        let mut by_reserved = nodes.clone();
        by_reserved.sort_by(|a, b| b.reserved_delta.cmp(&a.reserved_delta).then(a.node_id.cmp(&b.node_id)));
        by_reserved.truncate(MEMORY_BREAKDOWN_LIMIT);

        let mut by_allocated = nodes;
        by_allocated.sort_by(|a, b| b.allocated_delta.cmp(&a.allocated_delta).then(a.node_id.cmp(&b.node_id)));
        by_allocated.truncate(MEMORY_BREAKDOWN_LIMIT);

        Self { by_allocated, by_reserved }
    }

    /// Every listed node once, allocated ranking first
    pub fn nodes(&self) -> impl Iterator<Item = &NodeMemory> {
        let mut seen = BTreeSet::new();
        self.by_allocated
            .iter()
            .chain(&self.by_reserved)
            .filter(move |node| seen.insert(node.node_id))
    }
}

/// Summary of a replay run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub replayed_operators: usize,
    pub skipped: SkipSummary,
    /// Replayed over replayed plus skipped
    pub coverage: f64,
    pub warmup_iterations: usize,
    pub timed_iterations: usize,
    pub mean_iteration_ms: f64,
    pub total_time_ms: f64,
    /// Throughput of the last complete rolling window
    pub last_qps: Option<f64>,
    pub tensors: TensorStats,
    pub preprocess_ms: f64,
    pub latency: Option<NodeTiming>,
    pub memory: Option<MemoryBreakdown>,
}

impl ReplayReport {
    /// Serialize the report in the given format
    pub fn export(&self, format: ExportFormat) -> Result<Vec<u8>> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(Vec::new());
                writer.write_record(&["node_id", "name", "allocated_delta", "reserved_delta"])?;
                for node in self.memory.iter().flat_map(|m| m.nodes()) {
                    writer.serialize(node)?;
                }
                writer
                    .into_inner()
                    .map_err(|e| crate::error::Error::IoError(e.into_error()))
            }
            ExportFormat::Text => Ok(self.to_string().into_bytes()),
        }
    }

    /// Write an export to a file, creating parent directories
    pub fn write_to(&self, path: &Path, format: ExportFormat) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(&self.export(format)?)?;
        Ok(())
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Replayed operators: {}", self.replayed_operators)?;
        writeln!(
            f,
            "Skipped operators: {} (fused {}, unsupported {}, standard {}, specialized {}, other {})",
            self.skipped.total,
            self.skipped.count(SkipCategory::Fused),
            self.skipped.count(SkipCategory::Unsupported),
            self.skipped.count(SkipCategory::Standard),
            self.skipped.count(SkipCategory::Specialized),
            self.skipped.count(SkipCategory::Other),
        )?;
        writeln!(f, "Operator coverage: {:.4}", self.coverage)?;
        writeln!(
            f,
            "Tensors: {} tracked keys, {} replay tensors, {} keys with multiple shapes, {} instantiated",
            self.tensors.tracked_keys,
            self.tensors.replay_tensors,
            self.tensors.multi_shape_keys,
            self.tensors.must_instantiate
        )?;
        writeln!(
            f,
            "Iterations: {} warmup, {} timed",
            self.warmup_iterations, self.timed_iterations
        )?;
        write!(f, "Mean iteration time: {:.3} ms", self.mean_iteration_ms)?;
        if let Some(qps) = self.last_qps {
            write!(f, "\nQPS: {:.1}", qps)?;
        }
        if let Some(latency) = &self.latency {
            write!(
                f,
                "\nLookups: {}, setup {:.1} us, execution {:.1} us (p50 {:.2}, p90 {:.2}, p95 {:.2})",
                latency.lookup_count,
                latency.total_setup_us,
                latency.total_exec_us,
                latency.exec_percentiles.p50,
                latency.exec_percentiles.p90,
                latency.exec_percentiles.p95
            )?;
        }
        if let Some(memory) = &self.memory {
            write!(f, "\nAllocated memory (B):")?;
            for node in memory.by_allocated.iter().take(10) {
                write!(f, "\n  node {} {}: {:+}", node.node_id, node.name, node.allocated_delta)?;
            }
            write!(f, "\nReserved memory (B):")?;
            for node in memory.by_reserved.iter().take(10) {
                write!(f, "\n  node {} {}: {:+}", node.node_id, node.name, node.reserved_delta)?;
            }
        }
        Ok(())
    }
}

/// Percentile of sorted samples with linear interpolation between ranks
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}
