//! Process-wide registries for channel sessions and their capabilities.

pub mod capabilities;
pub mod connections;

pub use capabilities::CapabilityRegistry;
pub use connections::{ConnectionRegistry, Registered, SessionKey};
