//! RPC surface: bounded registries, typed variable values, the device
//! descriptor, and inbound request parsing.

pub mod describe;
pub mod dispatcher;
pub mod registry;
pub mod value;

pub use registry::{
    FileCallback, FunctionCall, FunctionCallback, FunctionFlags, Registries, SubscriptionHandler,
    SubscriptionScope, VariableCallback,
};
pub use value::{VariableKind, VariableValue};
