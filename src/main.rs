use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod advert;
mod cli;
mod config;
mod dispatch;
mod integrity;
mod link;
mod payload;
mod port;
mod proto;
mod report;
mod runner;
mod stats;
mod transfer;

use cli::{Cmd, LinkOpts, SimOpts};
use config::{Role, Settings};
use dispatch::EventDispatcher;
use link::sim::{SimConfig, SimLink};
use stats::{ManualClock, MonotonicClock};

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.debug);

    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    match args.cmd {
        Cmd::Peripheral(opts) => run_serial(Role::Peripheral, settings, &opts),
        Cmd::Central(opts) => {
            let mut settings = settings;
            settings.change_phy |= opts.change_phy;
            run_serial(Role::Central, settings, &opts.link)
        }
        Cmd::Sim(opts) => run_sim(settings, &opts),
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("ble_throughput=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ble_throughput=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_serial(role: Role, mut settings: Settings, opts: &LinkOpts) -> Result<()> {
    opts.test.apply(&mut settings)?;
    settings.validate_for(role)?;
    info!(%role, dev = %opts.ser.dev, baud = opts.ser.baud, "opening host link");

    let mut link = port::open_link(&opts.ser)?;
    let mut dispatcher = EventDispatcher::new(role, settings, MonotonicClock::new());
    runner::run(&mut link, &mut dispatcher, opts.exit_on_finish)?;
    for report in dispatcher.reports() {
        println!("{report}");
    }
    Ok(())
}

fn run_sim(mut settings: Settings, opts: &SimOpts) -> Result<()> {
    let role = opts.role()?;
    opts.test.apply(&mut settings)?;
    settings.change_phy |= opts.change_phy;
    settings.validate_for(role)?;
    if settings.effective_phase(role).is_none() {
        bail!("the simulated peer only receives: give {role} a phase to drive");
    }

    let clock = ManualClock::new();
    let sim = SimConfig {
        role,
        peer_name: settings.device_name.clone(),
        peer_mtu: opts.mtu,
        ptu_size: opts.ptu,
        queue_depth: opts.queue_depth.max(1),
        packets_per_interval: opts.packets_per_interval.max(1),
        ..SimConfig::default()
    };
    let mut link = SimLink::new(sim, clock.clone());
    let mut dispatcher = EventDispatcher::new(role, settings, clock);
    runner::run(&mut link, &mut dispatcher, true)?;

    if dispatcher.reports().is_empty() {
        bail!("simulation ended after {} ms without a report", link.now().as_millis());
    }
    for report in dispatcher.reports() {
        println!("{report}");
    }
    let peer = link.peer();
    println!(
        "peer: packets={} bytes={} invalid={}",
        peer.packets, peer.bytes, peer.invalid
    );
    Ok(())
}
