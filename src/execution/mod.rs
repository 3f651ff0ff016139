pub mod context;
pub mod engine;

pub use context::{ReplayOptions, SkipPolicy};
pub use engine::{Prepared, ReplayEngine, SchedulerState};
