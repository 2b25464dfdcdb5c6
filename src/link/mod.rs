//! Boundary to the radio stack: commands go in, events come out.

use thiserror::Error;

use crate::proto::command::{CommandStatus, LinkCommand, LinkEvent};

pub mod params;
pub mod pending;
pub mod sim;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response to {0}")]
    NoResponse(String),
    #[error("link closed")]
    Closed,
}

/// Accepts commands. `Busy` is a normal outcome, not an error.
pub trait CommandSink {
    fn submit(&mut self, cmd: &LinkCommand) -> Result<CommandStatus, LinkError>;
}

/// Produces stack events one at a time. `Ok(None)` means nothing arrived
/// within the source's poll window.
pub trait EventSource {
    fn next_event(&mut self) -> Result<Option<LinkEvent>, LinkError>;
}

pub trait LinkStack: CommandSink + EventSource {}

impl<T: CommandSink + EventSource> LinkStack for T {}
