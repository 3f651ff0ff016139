// tools module

pub mod report;

pub use report::{
    percentile, ExportFormat, LatencyPercentiles, MemoryBreakdown, NodeMemory, NodeTiming,
    ReplayReport, SkipSummary,
};
