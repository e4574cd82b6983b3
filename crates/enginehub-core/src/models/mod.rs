//! Shared data types.

mod capability;
mod command;
mod instance;

pub use capability::{CapabilityDescriptor, ParameterDescriptor};
pub use command::{Command, CommandOutcome, CommandResponse, CommandTarget};
pub use instance::{InstanceDescriptor, InstanceId, InstanceStatus, Reachability, SessionSummary};
