//! Boundary commands that must land eventually.

use std::collections::VecDeque;

use tracing::debug;

use crate::link::{CommandSink, LinkError};
use crate::proto::command::{CommandStatus, LinkCommand};

/// FIFO of commands the stack turned away as busy. Order is preserved:
/// while anything is queued, new commands line up behind it.
#[derive(Debug, Default)]
pub struct PendingCommands {
    queue: VecDeque<LinkCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Submit now, or queue if the stack is busy or earlier commands wait.
    pub fn submit(
        &mut self,
        cmd: LinkCommand,
        sink: &mut dyn CommandSink,
    ) -> Result<CommandStatus, LinkError> {
        debug_assert!(!cmd.is_stream_send(), "stream sends are retried, not queued");
        if !self.queue.is_empty() {
            debug!(?cmd, queued = self.queue.len(), "queued behind pending");
            self.queue.push_back(cmd);
            return Ok(CommandStatus::Busy);
        }
        let status = sink.submit(&cmd)?;
        if status == CommandStatus::Busy {
            debug!(?cmd, "busy, pending");
            self.queue.push_back(cmd);
        }
        Ok(status)
    }

    /// Resubmit queued commands in order until one is refused again.
    pub fn flush(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        while let Some(cmd) = self.queue.front() {
            match sink.submit(cmd)? {
                CommandStatus::Accepted => {
                    self.queue.pop_front();
                }
                CommandStatus::Busy => break,
            }
        }
        Ok(())
    }
}
