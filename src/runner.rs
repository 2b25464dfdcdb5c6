use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::dispatch::EventDispatcher;
use crate::link::{LinkError, LinkStack};
use crate::stats::Clock;

/// Feed link events to the dispatcher until the link closes, or until the
/// test has finished and every boundary command has landed when
/// `exit_on_finish` is set.
pub fn run<L: LinkStack, C: Clock>(
    link: &mut L,
    dispatcher: &mut EventDispatcher<C>,
    exit_on_finish: bool,
) -> Result<()> {
    loop {
        match link.next_event() {
            Ok(Some(event)) => dispatcher
                .handle(event, link)
                .context("handling link event")?,
            // quiet poll window: commands refused earlier still need to land
            Ok(None) => dispatcher.on_idle(link).context("retrying pending commands")?,
            Err(LinkError::Closed) => {
                info!(scanning = dispatcher.is_scanning(), "link closed");
                return Ok(());
            }
            Err(e) => return Err(e).context("reading link event"),
        }

        if exit_on_finish && dispatcher.is_finished() && dispatcher.pending_len() == 0 {
            debug!(reports = dispatcher.reports().len(), "test finished");
            return Ok(());
        }
    }
}
