pub mod allocator;
pub mod backend;
pub mod registry;

pub use allocator::{Allocation, Allocator};

pub use backend::{
    DeviceBackend,
    HostBackend,
};

pub use registry::{
    PermanentRegistry,
    WorkingRegistry,
};
