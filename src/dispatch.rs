//! Event dispatch: one link event in, zero or more commands out.
//!
//! Every event is handled in three steps: boundary commands still waiting
//! from earlier events are resubmitted, the event itself is applied, and
//! finally the stream gets one send opportunity.

use tracing::{debug, info, trace, warn};

use crate::advert::{build_adv_data, build_scan_response, matches_device_name};
use crate::config::{Role, Settings};
use crate::link::params::{ConnParams, LinkParameters, Phy};
use crate::link::pending::PendingCommands;
use crate::link::{CommandSink, LinkError};
use crate::proto::command::{CommandStatus, LinkCommand, LinkEvent};
use crate::proto::types::{
    AdvParams, Characteristic, ConnectionHandle, ScanParams, SubscriptionKind, TimerHandle, cccd,
};
use crate::report::{Direction, StatusSnapshot, TestReport};
use crate::stats::Clock;
use crate::test::state::{TestStateMachine, Transition};
use crate::test::test_config::TransferLimit;
use crate::transfer::{TransferController, TransportEnablement, TransportMode};

/// 100 ms in 0.625 ms units.
const ADV_INTERVAL: u16 = 160;
/// Channels 37, 38 and 39.
const ADV_CHANNEL_MAP: u8 = 0x07;

/// Control signal values on the display refresh characteristic.
const SIGNAL_TRANSFER_START: u8 = 0;
const SIGNAL_TRANSFER_END: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CccdStep {
    Idle,
    AwaitNotify,
    AwaitIndicate,
    Done,
}

/// Everything that lives exactly as long as one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub connection: Option<ConnectionHandle>,
    pub params: LinkParameters,
    pub enablement: TransportEnablement,
    pub transfer: TransferController,
    pub machine: TestStateMachine,
    /// PHY to request on the next connection parameter update.
    pub phy_to_use: Option<Phy>,
    pub rssi: Option<i8>,
    cccd: CccdStep,
    phy_change_requested: bool,
}

impl ConnectionSession {
    pub fn new(settings: &Settings, role: Role) -> Self {
        Self {
            connection: None,
            params: LinkParameters::new(
                settings.notify_chunk_override,
                settings.indicate_chunk_override,
            ),
            enablement: TransportEnablement::default(),
            transfer: TransferController::new(settings.limit),
            machine: TestStateMachine::new(settings.test_config(role)),
            phy_to_use: None,
            rssi: None,
            cccd: CccdStep::Idle,
            phy_change_requested: false,
        }
    }

    /// Drop all per-connection state, whatever was in flight.
    pub fn reset(&mut self) {
        self.connection = None;
        self.params.reset();
        self.enablement = TransportEnablement::default();
        self.transfer.reset();
        self.machine.reset();
        self.phy_to_use = None;
        self.rssi = None;
        self.cccd = CccdStep::Idle;
        self.phy_change_requested = false;
    }

    fn sync_chunk_sizes(&mut self) {
        self.transfer.set_chunk_sizes(
            self.params.max_notify_chunk(),
            self.params.max_indicate_chunk(),
        );
    }
}

pub struct EventDispatcher<C: Clock> {
    role: Role,
    settings: Settings,
    session: ConnectionSession,
    scanning: bool,
    /// Status refresh stopped while the peer drives a transfer.
    refresh_paused: bool,
    pending: PendingCommands,
    clock: C,
    reports: Vec<TestReport>,
}

impl<C: Clock> EventDispatcher<C> {
    pub fn new(role: Role, settings: Settings, clock: C) -> Self {
        let session = ConnectionSession::new(&settings, role);
        Self {
            role,
            settings,
            session,
            scanning: false,
            refresh_paused: false,
            pending: PendingCommands::new(),
            clock,
            reports: Vec::new(),
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reports(&self) -> &[TestReport] {
        &self.reports
    }

    /// The configured phase reached its terminal state. A receive-only
    /// controller is done once it has reported a transfer from the peer.
    pub fn is_finished(&self) -> bool {
        match self.session.machine.config().phase {
            Some(_) => self.session.machine.is_finished(),
            None => self
                .reports
                .iter()
                .any(|r| r.direction == Direction::Received),
        }
    }

    /// Retry waiting boundary commands and give the stream a send
    /// opportunity while the link has nothing to report.
    pub fn on_idle(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        self.pending.flush(sink)?;
        self.pump(sink)
    }

    pub fn handle(&mut self, event: LinkEvent, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        trace!(?event, "event");
        self.pending.flush(sink)?;

        match event {
            LinkEvent::SystemBoot => self.on_boot(sink)?,
            LinkEvent::ScanAdvertisementObserved { address, adv_data } => {
                if self.role == Role::Central
                    && self.scanning
                    && self.session.connection.is_none()
                    && matches_device_name(&adv_data, &self.settings.device_name)
                {
                    info!(%address, name = %self.settings.device_name, "peer found, connecting");
                    self.scanning = false;
                    self.pending.submit(LinkCommand::StopScan, sink)?;
                    self.pending.submit(LinkCommand::Connect(address), sink)?;
                }
            }
            LinkEvent::ConnectionOpened {
                connection,
                address,
            } => {
                info!(%address, handle = connection.0, "connection opened");
                self.session.connection = Some(connection);
                self.scanning = false;
            }
            LinkEvent::ConnectionClosed { reason } => self.on_closed(reason, sink)?,
            LinkEvent::MtuExchanged { connection, mtu } => {
                self.session.connection = Some(connection);
                let chunk = self.session.params.update_from_mtu_exchange(mtu);
                self.session.sync_chunk_sizes();
                info!(
                    mtu,
                    notify_chunk = chunk,
                    indicate_chunk = self.session.params.max_indicate_chunk(),
                    "mtu exchanged"
                );
                if self.role == Role::Central && self.session.cccd == CccdStep::Idle {
                    self.session.cccd = CccdStep::AwaitNotify;
                    self.pending.submit(
                        LinkCommand::WriteCccd {
                            characteristic: Characteristic::Notifications,
                            flags: cccd::NOTIFY,
                        },
                        sink,
                    )?;
                }
            }
            LinkEvent::ProcedureCompleted => self.on_procedure_completed(sink)?,
            LinkEvent::ConnectionParametersUpdated {
                ptu_size,
                interval_raw,
            } => self.on_conn_params(ptu_size, interval_raw, sink)?,
            LinkEvent::PhyStatusChanged { phy } => {
                info!(%phy, "phy changed");
                self.session.params.phy = phy;
                self.session.phy_to_use = None;
                self.session.machine.phy_change_complete();
            }
            LinkEvent::CharacteristicSubscriptionChanged {
                characteristic,
                enabled,
                kind,
            } => {
                let en = &mut self.session.enablement;
                match (characteristic, kind) {
                    (Characteristic::Notifications, SubscriptionKind::Notify) => {
                        en.notifications_enabled = enabled;
                    }
                    (Characteristic::Indications, SubscriptionKind::Indicate) => {
                        en.indications_enabled = enabled;
                    }
                    _ => debug!(?characteristic, ?kind, enabled, "subscription ignored"),
                }
                info!(
                    notify = en.notifications_enabled,
                    indicate = en.indications_enabled,
                    "subscriptions"
                );
            }
            LinkEvent::SendConfirmed { characteristic } => {
                if characteristic == Characteristic::Indications
                    && self.session.transfer.indication_in_flight()
                {
                    let len = self.session.transfer.indicate_len();
                    if self
                        .session
                        .transfer
                        .on_send_accepted(TransportMode::Indications, len)
                    {
                        self.end_transfer(sink)?;
                    }
                }
            }
            LinkEvent::DataReceived {
                characteristic,
                data,
                indication,
            } => self.on_data(characteristic, &data, indication, sink)?,
            LinkEvent::PeriodicTick { handle } => match handle {
                TimerHandle::StatusRefresh => self.on_status_refresh(sink)?,
                TimerHandle::FixedTransferTime => {
                    if self.session.transfer.is_streaming() {
                        info!("fixed transfer time elapsed");
                        self.session.transfer.disarm_all();
                        self.end_transfer(sink)?;
                    }
                }
            },
            LinkEvent::RssiReported { rssi } => self.session.rssi = Some(rssi),
            LinkEvent::LinkIdle => {}
        }

        self.pump(sink)
    }

    fn adv_params(&self) -> AdvParams {
        AdvParams {
            interval_min: ADV_INTERVAL,
            interval_max: ADV_INTERVAL,
            channel_map: ADV_CHANNEL_MAP,
            data: build_adv_data(&self.settings.device_name),
            scan_response: build_scan_response(),
        }
    }

    fn refresh_timer(&self, period_ms: u32) -> LinkCommand {
        LinkCommand::SchedulePeriodicTick {
            period_ms,
            handle: TimerHandle::StatusRefresh,
            single_shot: false,
        }
    }

    fn on_boot(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        info!(role = %self.role, name = %self.settings.device_name, "system boot");
        self.pending
            .submit(LinkCommand::SetMaxMtu(self.settings.max_mtu), sink)?;
        self.pending
            .submit(LinkCommand::SetTxPower(self.settings.tx_power_dbm), sink)?;
        match self.role {
            Role::Peripheral => {
                let adv = LinkCommand::SetAdvertising(self.adv_params());
                self.pending.submit(adv, sink)?;
            }
            Role::Central => {
                self.pending
                    .submit(LinkCommand::SetConnectionParameters(ConnParams::PHY_1M), sink)?;
                self.pending
                    .submit(LinkCommand::StartScan(ScanParams::DEFAULT), sink)?;
                self.scanning = true;
            }
        }
        let timer = self.refresh_timer(self.settings.refresh_period_ms);
        self.pending.submit(timer, sink)?;
        Ok(())
    }

    fn on_closed(&mut self, reason: u16, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        info!(
            reason = format_args!("{reason:#06x}"),
            state = ?self.session.machine.state(),
            "connection closed"
        );
        self.session.reset();
        self.pending.clear();
        match self.role {
            Role::Peripheral => {
                let adv = LinkCommand::SetAdvertising(self.adv_params());
                self.pending.submit(adv, sink)?;
            }
            Role::Central => {
                self.pending
                    .submit(LinkCommand::StartScan(ScanParams::DEFAULT), sink)?;
                self.scanning = true;
            }
        }
        if self.refresh_paused {
            self.refresh_paused = false;
            let timer = self.refresh_timer(self.settings.refresh_period_ms);
            self.pending.submit(timer, sink)?;
        }
        Ok(())
    }

    fn on_procedure_completed(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        match self.session.cccd {
            CccdStep::AwaitNotify => {
                self.session.enablement.notifications_enabled = true;
                self.session.cccd = CccdStep::AwaitIndicate;
                self.pending.submit(
                    LinkCommand::WriteCccd {
                        characteristic: Characteristic::Indications,
                        flags: cccd::INDICATE,
                    },
                    sink,
                )?;
            }
            CccdStep::AwaitIndicate => {
                self.session.enablement.indications_enabled = true;
                self.session.cccd = CccdStep::Done;
                info!("peer subscriptions enabled");
            }
            CccdStep::Idle | CccdStep::Done => {}
        }
        Ok(())
    }

    fn on_conn_params(
        &mut self,
        ptu_size: u16,
        interval_raw: u16,
        sink: &mut dyn CommandSink,
    ) -> Result<(), LinkError> {
        let chunk = self
            .session
            .params
            .update_from_connection_parameters(ptu_size, interval_raw);
        self.session.sync_chunk_sizes();
        info!(
            ptu = ptu_size,
            interval_ms = self.session.params.conn_interval_ms,
            notify_chunk = chunk,
            "connection parameters"
        );

        if let Some(phy) = self.session.phy_to_use {
            self.pending.submit(LinkCommand::SetPhy(phy), sink)?;
        } else if self.role == Role::Central
            && self.settings.change_phy
            && !self.session.phy_change_requested
        {
            self.session.phy_change_requested = true;
            let change = self
                .session
                .machine
                .request_phy_change(self.session.params.phy);
            self.session.phy_to_use = Some(change.to);
            self.pending
                .submit(LinkCommand::SetConnectionParameters(change.params), sink)?;
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
        indication: bool,
        sink: &mut dyn CommandSink,
    ) -> Result<(), LinkError> {
        if indication {
            match self.session.connection {
                Some(connection) => {
                    self.pending
                        .submit(LinkCommand::ConfirmIndicationReceipt { connection }, sink)?;
                }
                None => warn!("indication without a connection"),
            }
        }

        if characteristic != Characteristic::DisplayRefresh {
            let bad = self.session.transfer.on_data_received(data);
            if bad > 0 {
                debug!(bad, len = data.len(), "sequence anomalies in received chunk");
            }
            return Ok(());
        }

        let now = self.clock.now();
        match data.first().copied() {
            Some(SIGNAL_TRANSFER_START) => {
                info!("peer started a transfer");
                self.session.transfer.start_clock(now);
                self.refresh_paused = true;
                let stop = self.refresh_timer(0);
                self.pending.submit(stop, sink)?;
            }
            Some(SIGNAL_TRANSFER_END) => {
                self.session.transfer.stop_clock(now);
                let report = TestReport::from_stats(
                    Direction::Received,
                    "peer",
                    self.session.transfer.stats(),
                );
                report.log();
                self.reports.push(report);
                self.refresh_paused = false;
                let timer = self.refresh_timer(self.settings.refresh_period_ms);
                self.pending.submit(timer, sink)?;
            }
            other => warn!(?other, "unknown control signal"),
        }
        Ok(())
    }

    fn on_status_refresh(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        let connected = self.session.connection.is_some();
        let now = self.clock.now();
        // best effort, and never ahead of queued boundary commands
        if connected
            && self.pending.is_empty()
            && sink.submit(&LinkCommand::ReadRssi)? == CommandStatus::Busy
        {
            trace!("rssi read skipped, busy");
        }
        StatusSnapshot::new(
            self.role,
            connected,
            &self.session.params,
            self.session.enablement,
            self.session.transfer.stats(),
            self.session.transfer.throughput_now(now),
            self.session.rssi,
        )
        .log();

        let ready = connected && !self.scanning;
        match self.session.machine.on_tick(ready, &mut self.session.transfer) {
            Some(Transition::Started(phase)) => {
                let now = self.clock.now();
                self.session.transfer.start_clock(now);
                self.signal_peer(SIGNAL_TRANSFER_START, sink)?;
                if let TransferLimit::FixedDuration(t) = self.session.transfer.limit() {
                    let period_ms = t.as_millis().clamp(1, u32::MAX as u64) as u32;
                    self.pending.submit(
                        LinkCommand::SchedulePeriodicTick {
                            period_ms,
                            handle: TimerHandle::FixedTransferTime,
                            single_shot: true,
                        },
                        sink,
                    )?;
                }
                debug!(%phase, "transfer clock started");
            }
            Some(Transition::Stopped(_)) => {
                // the limiter may already have closed the transfer
                if self.session.transfer.clock_running() {
                    self.end_transfer(sink)?;
                }
            }
            Some(Transition::Finished(_)) | None => {}
        }
        Ok(())
    }

    fn signal_peer(&mut self, value: u8, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        let characteristic = Characteristic::DisplayRefresh;
        let data = vec![value];
        let cmd = match self.role {
            Role::Peripheral => LinkCommand::SendNotification {
                characteristic,
                data,
            },
            Role::Central => LinkCommand::WriteWithoutResponse {
                characteristic,
                data,
            },
        };
        self.pending.submit(cmd, sink)?;
        Ok(())
    }

    /// Close the measurement window, report, and tell the peer.
    fn end_transfer(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        let now = self.clock.now();
        self.session.transfer.stop_clock(now);
        let mode = match self.session.machine.config().phase {
            Some(p) => p.to_string(),
            None => "unknown".to_string(),
        };
        let report = TestReport::from_stats(Direction::Sent, mode, self.session.transfer.stats());
        report.log();
        self.reports.push(report);
        self.signal_peer(SIGNAL_TRANSFER_END, sink)
    }

    /// One stream send attempt. Boundary commands go first: nothing is
    /// streamed while any of them still waits.
    fn pump(&mut self, sink: &mut dyn CommandSink) -> Result<(), LinkError> {
        if self.session.connection.is_none() || !self.pending.is_empty() {
            return Ok(());
        }
        let Some((mode, cmd)) = self.session.transfer.poll_send(self.session.enablement) else {
            return Ok(());
        };
        match sink.submit(&cmd)? {
            CommandStatus::Accepted => match mode {
                TransportMode::Indications => self.session.transfer.on_indication_submitted(),
                _ => {
                    let len = self.session.transfer.notify_len();
                    if self.session.transfer.on_send_accepted(mode, len) {
                        self.end_transfer(sink)?;
                    }
                }
            },
            CommandStatus::Busy => self.session.transfer.on_send_rejected(mode),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;
    use crate::proto::types::Address;
    use crate::stats::{ManualClock, Ticks, TransferStats};
    use crate::test::state::TestState;
    use crate::test::test_config::TestPhase;

    /// Records every command; answers busy while the matching flag is set.
    #[derive(Default)]
    struct Recorder {
        commands: Vec<LinkCommand>,
        busy_streams: bool,
        busy_timers: bool,
        busy_all: bool,
    }

    impl CommandSink for Recorder {
        fn submit(&mut self, cmd: &LinkCommand) -> Result<CommandStatus, LinkError> {
            let timer = matches!(cmd, LinkCommand::SchedulePeriodicTick { .. });
            if self.busy_all
                || (self.busy_streams && cmd.is_stream_send())
                || (self.busy_timers && timer)
            {
                return Ok(CommandStatus::Busy);
            }
            self.commands.push(cmd.clone());
            Ok(CommandStatus::Accepted)
        }
    }

    impl Recorder {
        fn take(&mut self) -> Vec<LinkCommand> {
            std::mem::take(&mut self.commands)
        }
    }

    fn sends(cmds: &[LinkCommand], chr: Characteristic) -> Vec<Vec<u8>> {
        cmds.iter()
            .filter_map(|c| match c {
                LinkCommand::SendNotification {
                    characteristic,
                    data,
                }
                | LinkCommand::WriteWithoutResponse {
                    characteristic,
                    data,
                } if *characteristic == chr => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    const TICK: LinkEvent = LinkEvent::PeriodicTick {
        handle: TimerHandle::StatusRefresh,
    };

    fn dispatcher(role: Role, settings: Settings) -> (EventDispatcher<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        (EventDispatcher::new(role, settings, clock.clone()), clock)
    }

    /// Boot, connect and negotiate MTU 247 / PTU 27, both subscriptions on.
    fn connect(d: &mut EventDispatcher<ManualClock>, sink: &mut Recorder) {
        let conn = ConnectionHandle(1);
        let events = [
            LinkEvent::SystemBoot,
            LinkEvent::ConnectionOpened {
                connection: conn,
                address: Address([1, 2, 3, 4, 5, 6]),
            },
            LinkEvent::MtuExchanged {
                connection: conn,
                mtu: 247,
            },
            LinkEvent::ConnectionParametersUpdated {
                ptu_size: 27,
                interval_raw: 40,
            },
            LinkEvent::CharacteristicSubscriptionChanged {
                characteristic: Characteristic::Notifications,
                enabled: true,
                kind: SubscriptionKind::Notify,
            },
            LinkEvent::CharacteristicSubscriptionChanged {
                characteristic: Characteristic::Indications,
                enabled: true,
                kind: SubscriptionKind::Indicate,
            },
        ];
        for e in events {
            d.handle(e, sink).unwrap();
        }
        sink.take();
    }

    #[test]
    fn peripheral_boot_sequence() {
        let (mut d, _) = dispatcher(Role::Peripheral, Settings::default());
        let mut sink = Recorder::default();
        d.handle(LinkEvent::SystemBoot, &mut sink).unwrap();
        let cmds = sink.take();
        assert_eq!(cmds[0], LinkCommand::SetMaxMtu(250));
        assert_eq!(cmds[1], LinkCommand::SetTxPower(-50));
        match &cmds[2] {
            LinkCommand::SetAdvertising(p) => {
                assert_eq!(p.interval_min, 160);
                assert_eq!(p.channel_map, 7);
                assert!(matches_device_name(&p.data, "Throughput Tester"));
            }
            other => panic!("expected advertising, got {other:?}"),
        }
        assert_eq!(
            cmds[3],
            LinkCommand::SchedulePeriodicTick {
                period_ms: 1000,
                handle: TimerHandle::StatusRefresh,
                single_shot: false
            }
        );
        assert!(!d.is_scanning());
    }

    #[test]
    fn first_tick_starts_notification_stream() {
        let (mut d, _) = dispatcher(Role::Peripheral, Settings::default());
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        assert_eq!(d.session().machine.state(), TestState::Idle);

        d.handle(TICK, &mut sink).unwrap();
        let cmds = sink.take();
        assert_eq!(d.session().machine.state(), TestState::NotificationsRunning);
        assert_eq!(
            sends(&cmds, Characteristic::DisplayRefresh),
            vec![vec![SIGNAL_TRANSFER_START]]
        );
        let data = sends(&cmds, Characteristic::Notifications);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].len(), 236);
        assert_eq!(integrity::validate(&data[0]), 0);
        assert_eq!(d.session().transfer.stats().bits_sent, 236 * 8);

        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        let next = sends(&sink.take(), Characteristic::Notifications);
        assert_eq!(next[0][0], data[0][235].wrapping_add(1));
        assert_eq!(d.session().transfer.stats().bits_sent, 2 * 236 * 8);
    }

    #[test]
    fn busy_stream_waits_for_next_opportunity() {
        let (mut d, _) = dispatcher(Role::Peripheral, Settings::default());
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        sink.busy_streams = true;
        d.handle(TICK, &mut sink).unwrap();
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert_eq!(d.session().transfer.stats().operation_count, 0);
        assert!(sends(&sink.take(), Characteristic::Notifications).is_empty());

        sink.busy_streams = false;
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert_eq!(d.session().transfer.stats().operation_count, 1);
    }

    #[test]
    fn disconnect_resets_session() {
        let (mut d, _) = dispatcher(Role::Peripheral, Settings::default());
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert!(d.session().transfer.stats().bits_sent > 0);

        sink.take();
        d.handle(LinkEvent::ConnectionClosed { reason: 0x13 }, &mut sink)
            .unwrap();
        let s = d.session();
        assert_eq!(s.connection, None);
        assert_eq!(s.params, LinkParameters::new(None, None));
        assert_eq!(s.enablement, TransportEnablement::default());
        assert_eq!(*s.transfer.stats(), TransferStats::new());
        assert!(!s.transfer.is_streaming());
        assert_eq!(s.machine.state(), TestState::Idle);
        assert!(matches!(
            sink.take().as_slice(),
            [LinkCommand::SetAdvertising(_)]
        ));

        for _ in 0..3 {
            d.handle(TICK, &mut sink).unwrap();
            d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        }
        assert!(sink.take().is_empty());
        assert_eq!(d.session().machine.state(), TestState::Idle);
    }

    #[test]
    fn interval_ends_transfer_and_signals_peer() {
        let settings = Settings {
            test_interval_secs: 2,
            ..Settings::default()
        };
        let (mut d, clock) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        sink.take();
        for _ in 0..3 {
            clock.advance(Ticks(32_768));
            d.handle(TICK, &mut sink).unwrap();
        }
        assert_eq!(
            d.session().machine.state(),
            TestState::NotificationsStopping
        );
        let cmds = sink.take();
        assert_eq!(
            sends(&cmds, Characteristic::DisplayRefresh),
            vec![vec![SIGNAL_TRANSFER_END]]
        );
        let report = &d.reports()[0];
        assert!(report.pass);
        assert_eq!(report.elapsed_ticks, 3 * 32_768);

        d.handle(TICK, &mut sink).unwrap();
        assert!(d.is_finished());
        assert_eq!(d.session().machine.state(), TestState::NotificationsDone);
    }

    #[test]
    fn fixed_count_limit() {
        let settings = Settings {
            limit: TransferLimit::FixedCount(3),
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        sink.busy_all = true;
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        sink.busy_all = false;
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert!(!d.session().transfer.is_streaming());
        assert_eq!(d.session().transfer.stats().operation_count, 3);
        let cmds = sink.take();
        assert_eq!(sends(&cmds, Characteristic::Notifications).len(), 3);
        assert_eq!(
            sends(&cmds, Characteristic::DisplayRefresh),
            vec![vec![SIGNAL_TRANSFER_START], vec![SIGNAL_TRANSFER_END]]
        );
        assert_eq!(d.reports().len(), 1);

        d.handle(TICK, &mut sink).unwrap();
        d.handle(TICK, &mut sink).unwrap();
        assert!(d.is_finished());
        // the state machine stop does not report a second time
        assert_eq!(d.reports().len(), 1);
    }

    #[test]
    fn end_signal_pending_until_accepted() {
        let settings = Settings {
            limit: TransferLimit::FixedDuration(Ticks(32_768)),
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        sink.take();

        sink.busy_all = true;
        let expired = LinkEvent::PeriodicTick {
            handle: TimerHandle::FixedTransferTime,
        };
        d.handle(expired, &mut sink).unwrap();
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert_eq!(d.pending_len(), 1);

        sink.busy_all = false;
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert_eq!(d.pending_len(), 0);
        assert_eq!(
            sink.take(),
            vec![LinkCommand::SendNotification {
                characteristic: Characteristic::DisplayRefresh,
                data: vec![SIGNAL_TRANSFER_END]
            }]
        );
    }

    #[test]
    fn pending_boundary_commands_go_first() {
        let settings = Settings {
            limit: TransferLimit::FixedCount(2),
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);

        sink.busy_all = true;
        d.handle(TICK, &mut sink).unwrap();
        // start signal refused: nothing streams ahead of it
        assert_eq!(d.pending_len(), 1);
        assert_eq!(d.session().transfer.stats().operation_count, 0);

        sink.busy_all = false;
        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        let cmds = sink.take();
        assert!(matches!(
            &cmds[0],
            LinkCommand::SendNotification { characteristic: Characteristic::DisplayRefresh, data } if data == &vec![0]
        ));
        assert_eq!(sends(&cmds, Characteristic::Notifications).len(), 1);
    }

    #[test]
    fn indications_wait_for_confirmation() {
        let settings = Settings {
            phase: Some(TestPhase::Indications),
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        let first = sends(&sink.take(), Characteristic::Indications);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 244);

        d.handle(LinkEvent::LinkIdle, &mut sink).unwrap();
        assert!(sends(&sink.take(), Characteristic::Indications).is_empty());
        assert_eq!(d.session().transfer.stats().bits_sent, 0);

        d.handle(
            LinkEvent::SendConfirmed {
                characteristic: Characteristic::Indications,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(d.session().transfer.stats().bits_sent, 244 * 8);
        assert_eq!(sends(&sink.take(), Characteristic::Indications).len(), 1);
    }

    #[test]
    fn fixed_duration_timer() {
        let settings = Settings {
            limit: TransferLimit::FixedDuration(Ticks(32_768 * 2)),
            ..Settings::default()
        };
        let (mut d, clock) = dispatcher(Role::Peripheral, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        d.handle(TICK, &mut sink).unwrap();
        assert!(sink.take().contains(&LinkCommand::SchedulePeriodicTick {
            period_ms: 2000,
            handle: TimerHandle::FixedTransferTime,
            single_shot: true,
        }));

        clock.advance(Ticks(32_768 * 2));
        d.handle(
            LinkEvent::PeriodicTick {
                handle: TimerHandle::FixedTransferTime,
            },
            &mut sink,
        )
        .unwrap();
        assert!(!d.session().transfer.is_streaming());
        assert_eq!(d.reports()[0].elapsed_ticks, 65_536);
        assert_eq!(
            sends(&sink.take(), Characteristic::DisplayRefresh),
            vec![vec![SIGNAL_TRANSFER_END]]
        );
    }

    #[test]
    fn central_scans_connects_and_subscribes() {
        let (mut d, _) = dispatcher(Role::Central, Settings::default());
        let mut sink = Recorder::default();
        d.handle(LinkEvent::SystemBoot, &mut sink).unwrap();
        let cmds = sink.take();
        assert!(cmds.contains(&LinkCommand::SetConnectionParameters(ConnParams::PHY_1M)));
        assert!(cmds.contains(&LinkCommand::StartScan(ScanParams::DEFAULT)));
        assert!(d.is_scanning());

        let peer = Address([0xaa, 0, 0, 0, 0, 1]);
        d.handle(
            LinkEvent::ScanAdvertisementObserved {
                address: Address([0xbb, 0, 0, 0, 0, 2]),
                adv_data: build_adv_data("Someone Else"),
            },
            &mut sink,
        )
        .unwrap();
        assert!(sink.take().is_empty());
        d.handle(
            LinkEvent::ScanAdvertisementObserved {
                address: peer,
                adv_data: build_adv_data("Throughput Tester"),
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(
            sink.take(),
            vec![LinkCommand::StopScan, LinkCommand::Connect(peer)]
        );
        assert!(!d.is_scanning());

        let conn = ConnectionHandle(2);
        d.handle(
            LinkEvent::ConnectionOpened {
                connection: conn,
                address: peer,
            },
            &mut sink,
        )
        .unwrap();
        d.handle(
            LinkEvent::MtuExchanged {
                connection: conn,
                mtu: 247,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(
            sink.take(),
            vec![LinkCommand::WriteCccd {
                characteristic: Characteristic::Notifications,
                flags: cccd::NOTIFY
            }]
        );
        d.handle(LinkEvent::ProcedureCompleted, &mut sink).unwrap();
        assert_eq!(
            sink.take(),
            vec![LinkCommand::WriteCccd {
                characteristic: Characteristic::Indications,
                flags: cccd::INDICATE
            }]
        );
        d.handle(LinkEvent::ProcedureCompleted, &mut sink).unwrap();
        assert_eq!(
            d.session().enablement,
            TransportEnablement {
                notifications_enabled: true,
                indications_enabled: true
            }
        );
    }

    #[test]
    fn receiver_measures_peer_transfer() {
        let (mut d, clock) = dispatcher(Role::Central, Settings::default());
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        let signal = |v: u8| LinkEvent::DataReceived {
            characteristic: Characteristic::DisplayRefresh,
            data: vec![v],
            indication: false,
        };

        d.handle(signal(0), &mut sink).unwrap();
        assert_eq!(sink.take(), vec![d.refresh_timer(0)]);

        let mut buf = [0u8; 20];
        crate::payload::generate(&mut buf, 20);
        d.handle(
            LinkEvent::DataReceived {
                characteristic: Characteristic::Notifications,
                data: buf.to_vec(),
                indication: false,
            },
            &mut sink,
        )
        .unwrap();
        d.handle(
            LinkEvent::DataReceived {
                characteristic: Characteristic::Indications,
                data: buf.to_vec(),
                indication: true,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(
            sink.take(),
            vec![LinkCommand::ConfirmIndicationReceipt {
                connection: ConnectionHandle(1)
            }]
        );

        assert!(!d.is_finished());
        clock.advance(Ticks(32_768));
        d.handle(signal(1), &mut sink).unwrap();
        assert_eq!(sink.take(), vec![d.refresh_timer(1000)]);
        // receive-only: the peer's report ends the test
        assert!(d.is_finished());
        let r = &d.reports()[0];
        assert_eq!(r.direction, Direction::Received);
        assert_eq!(r.bits, 2 * 20 * 8);
        assert_eq!(r.throughput_bps, 320.0);
        assert!(r.pass);
    }

    #[test]
    fn rssi_read_waits_behind_pending_commands() {
        let (mut d, _) = dispatcher(Role::Central, Settings::default());
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);

        sink.busy_timers = true;
        d.handle(
            LinkEvent::DataReceived {
                characteristic: Characteristic::DisplayRefresh,
                data: vec![SIGNAL_TRANSFER_START],
                indication: false,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(d.pending_len(), 1);

        d.handle(TICK, &mut sink).unwrap();
        assert!(!sink.take().contains(&LinkCommand::ReadRssi));
        assert_eq!(d.pending_len(), 1);

        sink.busy_timers = false;
        d.handle(TICK, &mut sink).unwrap();
        assert_eq!(d.pending_len(), 0);
        assert_eq!(sink.take(), vec![d.refresh_timer(0), LinkCommand::ReadRssi]);
    }

    #[test]
    fn sender_with_phase_ignores_received_reports() {
        let settings = Settings {
            phase: Some(TestPhase::WriteNoResponse),
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Central, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        for v in [SIGNAL_TRANSFER_START, SIGNAL_TRANSFER_END] {
            d.handle(
                LinkEvent::DataReceived {
                    characteristic: Characteristic::DisplayRefresh,
                    data: vec![v],
                    indication: false,
                },
                &mut sink,
            )
            .unwrap();
        }
        assert_eq!(d.reports().len(), 1);
        assert!(!d.is_finished());
    }

    #[test]
    fn central_write_stream_and_phy_change() {
        let settings = Settings {
            phase: Some(TestPhase::WriteNoResponse),
            change_phy: true,
            ..Settings::default()
        };
        let (mut d, _) = dispatcher(Role::Central, settings);
        let mut sink = Recorder::default();
        connect(&mut d, &mut sink);
        // the parameter update in connect() asked for 2M parameters
        assert_eq!(d.session().phy_to_use, Some(Phy::TwoM));
        assert_eq!(d.session().machine.state(), TestState::PhyChanging);

        d.handle(
            LinkEvent::ConnectionParametersUpdated {
                ptu_size: 27,
                interval_raw: 20,
            },
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink.take(), vec![LinkCommand::SetPhy(Phy::TwoM)]);
        d.handle(LinkEvent::PhyStatusChanged { phy: Phy::TwoM }, &mut sink)
            .unwrap();
        assert_eq!(d.session().params.phy, Phy::TwoM);
        assert_eq!(d.session().phy_to_use, None);
        assert_eq!(d.session().machine.state(), TestState::Idle);

        d.handle(TICK, &mut sink).unwrap();
        let cmds = sink.take();
        assert_eq!(d.session().machine.state(), TestState::WriteNoRespRunning);
        assert!(cmds.contains(&LinkCommand::WriteWithoutResponse {
            characteristic: Characteristic::DisplayRefresh,
            data: vec![0]
        }));
        let writes = sends(&cmds, Characteristic::WriteNoResponse);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 236);
    }
}
