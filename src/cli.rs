use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};

use crate::config::{Role, Settings};
use crate::test::test_config::TestPhase;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ble-throughput",
    about = "BLE GATT throughput tester (peripheral / central / simulated link)"
)]
pub struct Cli {
    /// Debug-level logging for this crate
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    /// TOML settings file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Advertise, accept a connection and stream to the central
    Peripheral(LinkOpts),
    /// Scan for the tester by name, connect and subscribe
    Central(CentralOpts),
    /// Run a complete test against the in-process link simulator
    Sim(SimOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device of the radio co-processor
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
    /// How long to wait for the stack to answer a command
    #[arg(long, default_value_t = 1_000)]
    pub response_timeout_ms: u64,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TestOpts {
    /// "notifications", "indications" or "write-no-response"
    #[arg(long)]
    pub phase: Option<String>,
    /// Seconds a phase runs when no count/duration limit is set
    #[arg(long)]
    pub interval: Option<u32>,
    /// Stop after this many accepted sends
    #[arg(long)]
    pub count: Option<u32>,
    /// Stop after this many 32768 Hz ticks
    #[arg(long)]
    pub duration_ticks: Option<u64>,
    /// Fixed notification / write chunk size
    #[arg(long)]
    pub notify_size: Option<u16>,
    /// Fixed indication chunk size
    #[arg(long)]
    pub indicate_size: Option<u16>,
    /// Device name to advertise or look for
    #[arg(long)]
    pub name: Option<String>,
}

impl TestOpts {
    /// Layer the flags over `settings`.
    pub fn apply(&self, settings: &mut Settings) -> Result<()> {
        if let Some(p) = &self.phase {
            let phase: TestPhase = p.parse().map_err(|_| {
                anyhow!("phase must be notifications, indications or write-no-response")
            })?;
            settings.phase = Some(phase);
        }
        if let Some(n) = self.interval {
            settings.test_interval_secs = n;
        }
        if let Some(n) = self.notify_size {
            settings.notify_chunk_override = Some(n);
        }
        if let Some(n) = self.indicate_size {
            settings.indicate_chunk_override = Some(n);
        }
        if let Some(name) = &self.name {
            settings.device_name = name.clone();
        }
        settings.apply_limit_flags(self.count, self.duration_ticks)?;
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct LinkOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(flatten)]
    pub test: TestOpts,
    /// Exit once the test phase is done instead of serving reconnects
    #[arg(long, default_value_t = false)]
    pub exit_on_finish: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CentralOpts {
    #[command(flatten)]
    pub link: LinkOpts,
    /// Cycle the PHY once after the first connection parameter update
    #[arg(long, default_value_t = false)]
    pub change_phy: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SimOpts {
    /// "peripheral" or "central"
    #[arg(long, default_value = "peripheral")]
    pub role: String,
    #[command(flatten)]
    pub test: TestOpts,
    /// Transmit buffers of the simulated stack
    #[arg(long, default_value_t = 8)]
    pub queue_depth: usize,
    /// Packets sent per connection event
    #[arg(long, default_value_t = 4)]
    pub packets_per_interval: usize,
    /// ATT MTU the simulated peer accepts
    #[arg(long, default_value_t = 247)]
    pub mtu: u16,
    /// Link-layer PDU size the simulated peer negotiates
    #[arg(long, default_value_t = 27)]
    pub ptu: u16,
    /// Cycle the PHY once (central only)
    #[arg(long, default_value_t = false)]
    pub change_phy: bool,
}

impl SimOpts {
    pub fn role(&self) -> Result<Role> {
        self.role
            .parse()
            .map_err(|_| anyhow!("role must be 'peripheral' or 'central'"))
    }
}
