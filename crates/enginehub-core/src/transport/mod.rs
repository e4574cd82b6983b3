//! Transports that carry commands to instances.
//!
//! # Architecture
//!
//! - **Framed**: connect-per-call to a port advertised in a descriptor file
//! - **Channel**: long-lived connection the instance opened to the hub,
//!   multiplexed by correlation id
//! - **Listener**: accepts channel connections and runs their handshake
//! - **Framing / Protocol**: length-prefixed frames and the JSON messages inside

pub mod channel;
pub mod framed;
pub mod framing;
pub mod listener;
pub mod protocol;

pub use channel::{ChannelEvent, SessionChannelClient};
pub use framed::FramedSocketClient;
pub use listener::{SessionListener, SessionListenerHandle};

use crate::error::Result;
use crate::models::{Command, CommandResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Uniform send contract over both transports.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Deliver one command and await its correlated response.
    ///
    /// Fails with a connection error (unreachable, dropped), a protocol error
    /// (malformed frame) or a timeout once `timeout` elapses.
    async fn send(&self, command: &Command, timeout: Duration) -> Result<CommandResponse>;

    /// Confirm the endpoint can take a command, within `timeout`.
    ///
    /// Connect-per-call transports have nothing to check.
    async fn ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Human-readable endpoint for logs and errors.
    fn endpoint(&self) -> String;
}
