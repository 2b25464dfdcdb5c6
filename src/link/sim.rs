//! In-process link stack driven by a virtual 32.768 kHz clock.
//!
//! The simulated peer connects as soon as we advertise (or advertises as
//! soon as we scan), negotiates a fixed MTU and PTU, subscribes to both
//! streams and swallows whatever is sent, validating every chunk. Time
//! only moves when the controller asks for the next event and nothing is
//! queued, so a whole test runs in milliseconds of wall time.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::advert::build_adv_data;
use crate::config::Role;
use crate::integrity;
use crate::link::params::interval_raw_to_ms;
use crate::link::{CommandSink, EventSource, LinkError};
use crate::proto::command::{CommandStatus, LinkCommand, LinkEvent};
use crate::proto::parser::{format_command, format_event, format_response};
use crate::proto::types::{Address, Characteristic, ConnectionHandle, SubscriptionKind, TimerHandle};
use crate::stats::{Clock, ManualClock, Ticks};

const PEER_ADDRESS: Address = Address([0x00, 0x0b, 0x57, 0x5e, 0xa1, 0x01]);
const DECOY_ADDRESS: Address = Address([0x00, 0x0b, 0x57, 0x5e, 0xa1, 0x02]);
const CONNECTION: ConnectionHandle = ConnectionHandle(1);
/// ATT default until the stack is told otherwise.
const DEFAULT_MTU: u16 = 23;
/// 50 ms, what a central asks for before any PHY-specific update.
const DEFAULT_INTERVAL_RAW: u16 = 40;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Role of the controller driving the simulator.
    pub role: Role,
    /// Name the simulated peripheral advertises.
    pub peer_name: String,
    pub peer_mtu: u16,
    pub ptu_size: u16,
    /// Transmit buffers; sends are refused while all are taken.
    pub queue_depth: usize,
    /// Packets the radio gets out per connection event.
    pub packets_per_interval: usize,
    pub rssi: i8,
    /// Virtual time after which the link reports itself closed.
    pub time_limit: Ticks,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            role: Role::Peripheral,
            peer_name: "Throughput Tester".to_string(),
            peer_mtu: 247,
            ptu_size: 27,
            queue_depth: 8,
            packets_per_interval: 4,
            rssi: -48,
            time_limit: Ticks::from_millis(120_000),
        }
    }
}

/// What the simulated peer saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub bytes: u64,
    pub packets: u64,
    pub invalid: u64,
    pub signals: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Timer {
    handle: TimerHandle,
    period: Ticks,
    due: Ticks,
    single_shot: bool,
}

pub struct SimLink {
    cfg: SimConfig,
    clock: ManualClock,
    events: VecDeque<LinkEvent>,
    timers: Vec<Timer>,
    connected: bool,
    max_mtu: u16,
    interval_raw: u16,
    queued: usize,
    next_drain: Option<Ticks>,
    indication_due: Option<Ticks>,
    peer: PeerStats,
}

impl SimLink {
    pub fn new(cfg: SimConfig, clock: ManualClock) -> Self {
        let mut events = VecDeque::new();
        events.push_back(LinkEvent::SystemBoot);
        Self {
            cfg,
            clock,
            events,
            timers: Vec::new(),
            connected: false,
            max_mtu: DEFAULT_MTU,
            interval_raw: DEFAULT_INTERVAL_RAW,
            queued: 0,
            next_drain: None,
            indication_due: None,
            peer: PeerStats::default(),
        }
    }

    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    pub fn peer(&self) -> &PeerStats {
        &self.peer
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Simulate the peer going away. Events not yet delivered are lost.
    #[cfg(test)]
    pub fn drop_connection(&mut self, reason: u16) {
        if !self.connected {
            return;
        }
        debug!(reason, "sim: dropping connection");
        self.connected = false;
        self.events.clear();
        self.queued = 0;
        self.next_drain = None;
        self.indication_due = None;
        self.events.push_back(LinkEvent::ConnectionClosed { reason });
    }

    fn interval(&self) -> Ticks {
        let ms = interval_raw_to_ms(self.interval_raw).max(1);
        Ticks::from_millis(ms as u64)
    }

    fn open_connection(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        let mtu = self.max_mtu.min(self.cfg.peer_mtu);
        debug!(mtu, ptu = self.cfg.ptu_size, "sim: connected");
        self.events.push_back(LinkEvent::ConnectionOpened {
            connection: CONNECTION,
            address: PEER_ADDRESS,
        });
        self.events.push_back(LinkEvent::MtuExchanged {
            connection: CONNECTION,
            mtu,
        });
        self.events.push_back(LinkEvent::ConnectionParametersUpdated {
            ptu_size: self.cfg.ptu_size,
            interval_raw: self.interval_raw,
        });
        if self.cfg.role == Role::Peripheral {
            // the simulated central subscribes right away
            for (characteristic, kind) in [
                (Characteristic::Notifications, SubscriptionKind::Notify),
                (Characteristic::Indications, SubscriptionKind::Indicate),
            ] {
                self.events
                    .push_back(LinkEvent::CharacteristicSubscriptionChanged {
                        characteristic,
                        enabled: true,
                        kind,
                    });
            }
        }
    }

    fn deliver(&mut self, characteristic: Characteristic, data: &[u8]) {
        if characteristic == Characteristic::DisplayRefresh {
            self.peer.signals.extend_from_slice(data);
            return;
        }
        self.peer.bytes += data.len() as u64;
        self.peer.packets += 1;
        self.peer.invalid += integrity::validate(data);
    }

    /// A stream packet through the bounded transmit queue.
    fn queue_packet(&mut self, characteristic: Characteristic, data: &[u8]) -> CommandStatus {
        if characteristic == Characteristic::DisplayRefresh {
            self.deliver(characteristic, data);
            return CommandStatus::Accepted;
        }
        if self.queued >= self.cfg.queue_depth {
            return CommandStatus::Busy;
        }
        self.queued += 1;
        self.deliver(characteristic, data);
        if self.next_drain.is_none() {
            self.next_drain = Some(Ticks(self.now().0 + self.interval().0));
        }
        if self.queued < self.cfg.queue_depth {
            self.events.push_back(LinkEvent::LinkIdle);
        }
        CommandStatus::Accepted
    }

    fn indicate(&mut self, data: &[u8]) -> CommandStatus {
        if self.indication_due.is_some() {
            return CommandStatus::Busy;
        }
        self.deliver(Characteristic::Indications, data);
        self.indication_due = Some(Ticks(self.now().0 + self.interval().0));
        CommandStatus::Accepted
    }

    fn next_due(&self) -> Option<Ticks> {
        self.timers
            .iter()
            .map(|t| t.due)
            .chain(self.next_drain)
            .chain(self.indication_due)
            .min()
    }

    /// Move the clock to `now` and raise everything due by then.
    fn fire_due(&mut self, now: Ticks) {
        self.clock.set(now);

        if let Some(due) = self.next_drain
            && due <= now
        {
            let sent = self.cfg.packets_per_interval.min(self.queued);
            let interval = self.interval();
            self.queued -= sent;
            self.next_drain = (self.queued > 0).then_some(Ticks(due.0 + interval.0));
            trace!(sent, queued = self.queued, "sim: connection event");
            self.events.push_back(LinkEvent::LinkIdle);
        }

        if let Some(due) = self.indication_due
            && due <= now
        {
            self.indication_due = None;
            self.events.push_back(LinkEvent::SendConfirmed {
                characteristic: Characteristic::Indications,
            });
        }

        let mut fired = Vec::new();
        self.timers.retain_mut(|t| {
            if t.due > now {
                return true;
            }
            fired.push(t.handle);
            t.due = Ticks(t.due.0 + t.period.0);
            !t.single_shot
        });
        for handle in fired {
            self.events.push_back(LinkEvent::PeriodicTick { handle });
        }
    }
}

impl CommandSink for SimLink {
    fn submit(&mut self, cmd: &LinkCommand) -> Result<CommandStatus, LinkError> {
        let status = match cmd {
            LinkCommand::SendNotification {
                characteristic,
                data,
            } => match (self.connected, characteristic) {
                (false, _) => CommandStatus::Accepted,
                (true, Characteristic::Indications) => self.indicate(data),
                (true, c) => self.queue_packet(*c, data),
            },
            LinkCommand::WriteWithoutResponse {
                characteristic,
                data,
            } => match self.connected {
                false => CommandStatus::Accepted,
                true => self.queue_packet(*characteristic, data),
            },
            LinkCommand::WriteCccd { .. } => {
                self.events.push_back(LinkEvent::ProcedureCompleted);
                CommandStatus::Accepted
            }
            LinkCommand::ConfirmIndicationReceipt { .. } => CommandStatus::Accepted,
            LinkCommand::SetConnectionParameters(p) => {
                self.interval_raw = p.max_interval;
                if self.connected {
                    self.events.push_back(LinkEvent::ConnectionParametersUpdated {
                        ptu_size: self.cfg.ptu_size,
                        interval_raw: self.interval_raw,
                    });
                }
                CommandStatus::Accepted
            }
            LinkCommand::SetPhy(phy) => {
                if self.connected {
                    self.events.push_back(LinkEvent::PhyStatusChanged { phy: *phy });
                }
                CommandStatus::Accepted
            }
            LinkCommand::SetMaxMtu(mtu) => {
                self.max_mtu = *mtu;
                CommandStatus::Accepted
            }
            LinkCommand::SetTxPower(_) => CommandStatus::Accepted,
            LinkCommand::ReadRssi => {
                self.events
                    .push_back(LinkEvent::RssiReported { rssi: self.cfg.rssi });
                CommandStatus::Accepted
            }
            LinkCommand::SetAdvertising(_) => {
                self.open_connection();
                CommandStatus::Accepted
            }
            LinkCommand::StartScan(_) => {
                self.events.push_back(LinkEvent::ScanAdvertisementObserved {
                    address: DECOY_ADDRESS,
                    adv_data: build_adv_data("Keyboard"),
                });
                self.events.push_back(LinkEvent::ScanAdvertisementObserved {
                    address: PEER_ADDRESS,
                    adv_data: build_adv_data(&self.cfg.peer_name),
                });
                CommandStatus::Accepted
            }
            LinkCommand::StopScan => CommandStatus::Accepted,
            LinkCommand::Connect(_) => {
                self.open_connection();
                CommandStatus::Accepted
            }
            LinkCommand::SchedulePeriodicTick {
                period_ms,
                handle,
                single_shot,
            } => {
                self.timers.retain(|t| t.handle != *handle);
                if *period_ms > 0 {
                    let period = Ticks::from_millis(*period_ms as u64);
                    self.timers.push(Timer {
                        handle: *handle,
                        period,
                        due: Ticks(self.now().0 + period.0),
                        single_shot: *single_shot,
                    });
                }
                CommandStatus::Accepted
            }
        };
        trace!(
            cmd = format_command(cmd).trim_end(),
            rsp = format_response(status).trim_end(),
            "sim"
        );
        Ok(status)
    }
}

impl EventSource for SimLink {
    fn next_event(&mut self) -> Result<Option<LinkEvent>, LinkError> {
        if let Some(ev) = self.events.pop_front() {
            trace!(evt = format_event(&ev).trim_end(), "sim");
            return Ok(Some(ev));
        }
        let Some(due) = self.next_due() else {
            return Err(LinkError::Closed);
        };
        if due > self.cfg.time_limit {
            debug!(now = self.now().0, "sim: time limit reached");
            return Err(LinkError::Closed);
        }
        self.fire_due(due.max(self.now()));
        let ev = self.events.pop_front();
        if let Some(ev) = &ev {
            trace!(evt = format_event(ev).trim_end(), "sim");
        }
        Ok(ev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::dispatch::EventDispatcher;
    use crate::link::params::Phy;
    use crate::runner;
    use crate::test::test_config::{TestPhase, TransferLimit};

    fn run(role: Role, settings: Settings, sim: SimConfig) -> (EventDispatcher<ManualClock>, SimLink) {
        let clock = ManualClock::new();
        let mut link = SimLink::new(SimConfig { role, ..sim }, clock.clone());
        let mut d = EventDispatcher::new(role, settings, clock);
        runner::run(&mut link, &mut d, true).unwrap();
        (d, link)
    }

    #[test]
    fn notifications_end_to_end() {
        let settings = Settings {
            test_interval_secs: 2,
            ..Settings::default()
        };
        let (d, link) = run(Role::Peripheral, settings, SimConfig::default());
        assert!(d.is_finished());
        let report = &d.reports()[0];
        assert!(report.pass, "{report}");
        assert_eq!(report.mode, "notifications");
        assert_eq!(report.bits, link.peer().bytes * 8);
        assert_eq!(link.peer().invalid, 0);
        assert_eq!(link.peer().signals, vec![0, 1]);
        // 4 packets of 236 bytes every 50 ms
        let expected = 4.0 * 236.0 * 8.0 / 0.05;
        assert!((report.throughput_bps - expected).abs() / expected < 0.05);
    }

    #[test]
    fn indications_one_per_interval() {
        let settings = Settings {
            phase: Some(TestPhase::Indications),
            limit: TransferLimit::FixedCount(20),
            ..Settings::default()
        };
        let (d, link) = run(Role::Peripheral, settings, SimConfig::default());
        let report = &d.reports()[0];
        assert_eq!(report.operations, 20);
        assert_eq!(link.peer().packets, 20);
        assert_eq!(report.bits, 20 * 244 * 8);
        // confirmed one connection interval after each send
        assert_eq!(report.elapsed_ticks / 20, Ticks::from_millis(50).0);
    }

    #[test]
    fn central_writes_after_phy_change() {
        let settings = Settings {
            phase: Some(TestPhase::WriteNoResponse),
            limit: TransferLimit::FixedDuration(Ticks(32_768)),
            change_phy: true,
            ..Settings::default()
        };
        let (d, link) = run(Role::Central, settings, SimConfig::default());
        assert!(d.is_finished());
        assert_eq!(d.session().params.phy, Phy::TwoM);
        assert_eq!(d.session().params.conn_interval_ms, 25);
        let report = &d.reports()[0];
        assert!(report.pass);
        assert_eq!(report.elapsed_ticks, 32_768);
        assert_eq!(link.peer().invalid, 0);
    }

    #[test]
    fn reconnects_after_drop() {
        let clock = ManualClock::new();
        let mut link = SimLink::new(SimConfig::default(), clock.clone());
        let settings = Settings {
            test_interval_secs: 1,
            ..Settings::default()
        };
        let mut d = EventDispatcher::new(Role::Peripheral, settings, clock);
        while !d.session().transfer.is_streaming() {
            let ev = link.next_event().unwrap().unwrap();
            d.handle(ev, &mut link).unwrap();
        }
        link.drop_connection(0x08);
        let ev = link.next_event().unwrap().unwrap();
        assert_eq!(ev, LinkEvent::ConnectionClosed { reason: 0x08 });
        d.handle(ev, &mut link).unwrap();
        assert!(!d.session().transfer.is_streaming());

        // re-advertising brings the peer straight back
        assert!(link.is_connected());
        runner::run(&mut link, &mut d, true).unwrap();
        assert!(d.is_finished());
        assert!(d.reports().iter().any(|r| r.pass));
    }

    #[test]
    fn stalls_report_closed() {
        let mut link = SimLink::new(SimConfig::default(), ManualClock::new());
        assert_eq!(link.next_event().unwrap(), Some(LinkEvent::SystemBoot));
        assert!(matches!(link.next_event(), Err(LinkError::Closed)));
    }
}
