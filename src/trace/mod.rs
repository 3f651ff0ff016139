pub mod node;
pub mod types;
pub mod loader;

pub use node::{Argument, NodeId, NodeKind, TensorArg, TensorKey, TraceNode};
pub use types::{TypeDescriptor, UNINITIALIZED_ELEMENT};
pub use loader::{Trace, SYNTHETIC_ROOT_ID};
