pub mod registry;
pub mod tensor;
pub mod value;
pub mod builtin;

pub mod prelude {
    pub use super::registry::{OperatorRegistry, OperatorResolver, ReplayOperator, Resolution};
    pub use super::tensor::{DataType, Device, Shape, Tensor};
    pub use super::value::{OpArg, OpValue};
}

pub use registry::{
    GeneratedInputs, InputGenerator, OperatorFamily, OperatorRegistry, OperatorResolver,
    OperatorTraits, ReplayOperator, Resolution, ResolvedOperator,
};
pub use tensor::{synthesize_tensor, DataType, Device, Shape, Tensor};
pub use value::{describe_args, flatten_outputs, OpArg, OpValue};
