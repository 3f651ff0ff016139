pub mod error;
pub mod trace;
pub mod ops;
pub mod analysis;
pub mod memory;
pub mod execution;
pub mod tools;

// Re-export commonly used types
pub use error::{Error, Result};
pub use trace::{Argument, NodeId, NodeKind, TensorKey, Trace, TraceNode, TypeDescriptor};
pub use ops::{
    DataType, Device, GeneratedInputs, InputGenerator, OpArg, OpValue, OperatorFamily,
    OperatorRegistry, OperatorResolver, OperatorTraits, ReplayOperator, Resolution,
    ResolvedOperator, Tensor,
};
pub use analysis::{AnalysisPass, ReplayPlan, ReplayTensorId, Role, SkipCategory, SkipPolicy, TensorStats};
pub use memory::{Allocation, Allocator, DeviceBackend, HostBackend, PermanentRegistry, WorkingRegistry};
pub use execution::engine::{ReplayEngine, SchedulerState};
pub use execution::context::ReplayOptions;
pub use tools::report::{ExportFormat, ReplayReport};
