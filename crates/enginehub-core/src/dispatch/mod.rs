//! Command dispatch with bounded retry.

pub mod dispatcher;
pub mod retry;

pub use dispatcher::{
    CommandDispatcher, DispatchPhase, DispatchReceipt, HubTransports, TransportResolver,
};
pub use retry::{RetryPolicy, RetryState};
