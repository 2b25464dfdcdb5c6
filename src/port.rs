use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{trace, warn};

use crate::cli::SerialOpts;
use crate::link::{CommandSink, EventSource, LinkError};
use crate::proto::command::{CommandStatus, LinkCommand, LinkEvent};
use crate::proto::parser::{HostLine, format_command, parse_line};

/// Read timeout of the port; also the poll window of `next_event`.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub fn open_port(opts: &SerialOpts) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(POLL_TIMEOUT)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))
}

/// Link stack reached over a serial port.
pub type SerialLink = HostLink<Box<dyn SerialPort>, Box<dyn SerialPort>>;

pub fn open_link(opts: &SerialOpts) -> Result<SerialLink> {
    let port = open_port(opts)?;
    let writer = port
        .try_clone()
        .with_context(|| format!("clone {}", opts.dev))?;
    Ok(HostLink::new(
        port,
        writer,
        Duration::from_millis(opts.response_timeout_ms),
    ))
}

/// Line protocol client: writes `CMD` lines, waits for the `RSP` to each,
/// and queues `EVT` lines that show up in between.
pub struct HostLink<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: W,
    /// Bytes of a line cut short by a read timeout.
    partial: Vec<u8>,
    events: VecDeque<LinkEvent>,
    response_timeout: Duration,
}

impl<R: Read, W: Write> HostLink<R, W> {
    pub fn new(reader: R, writer: W, response_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            partial: Vec::with_capacity(600),
            events: VecDeque::new(),
            response_timeout,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        trace!(line = line.trim_end(), "host link tx");
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// One complete line, or `None` if the read timed out first.
    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        match self.reader.read_until(b'\n', &mut self.partial) {
            Ok(0) => Err(LinkError::Closed),
            Ok(_) if self.partial.last() != Some(&b'\n') => Ok(None),
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.partial).trim_end().to_string();
                self.partial.clear();
                Ok(Some(line))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_host_line(&mut self) -> Result<Option<HostLine>, LinkError> {
        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        if line.is_empty() {
            return Ok(None);
        }
        trace!(%line, "host link rx");
        match parse_line(&line) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                warn!(error = %e, %line, "skipping malformed line");
                Ok(None)
            }
        }
    }
}

impl<R: Read, W: Write> CommandSink for HostLink<R, W> {
    fn submit(&mut self, cmd: &LinkCommand) -> Result<CommandStatus, LinkError> {
        let line = format_command(cmd);
        self.write_line(&line)?;
        let deadline = Instant::now() + self.response_timeout;
        loop {
            match self.read_host_line()? {
                Some(HostLine::Response(status)) => return Ok(status),
                Some(HostLine::Event(event)) => self.events.push_back(event),
                Some(HostLine::Command(c)) => warn!(?c, "stack sent a command, ignored"),
                None => {
                    if Instant::now() >= deadline {
                        return Err(LinkError::NoResponse(line.trim_end().to_string()));
                    }
                }
            }
        }
    }
}

impl<R: Read, W: Write> EventSource for HostLink<R, W> {
    fn next_event(&mut self) -> Result<Option<LinkEvent>, LinkError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        match self.read_host_line()? {
            Some(HostLine::Event(event)) => Ok(Some(event)),
            Some(HostLine::Response(status)) => {
                warn!(?status, "response without a command");
                Ok(None)
            }
            Some(HostLine::Command(c)) => {
                warn!(?c, "stack sent a command, ignored");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
