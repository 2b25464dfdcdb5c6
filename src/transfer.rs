//! Stream gatekeeper: decides which transport may send, keeps the payload
//! buffers and the transfer statistics.

use tracing::{debug, trace};

use crate::integrity;
use crate::payload::PayloadBuffer;
use crate::proto::command::LinkCommand;
use crate::proto::types::Characteristic;
use crate::stats::{Ticks, TransferStats};
use crate::test::test_config::{TestPhase, TransferLimit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Notifications,
    Indications,
    WriteNoResponse,
}

impl TransportMode {
    pub fn characteristic(self) -> Characteristic {
        match self {
            TransportMode::Notifications => Characteristic::Notifications,
            TransportMode::Indications => Characteristic::Indications,
            TransportMode::WriteNoResponse => Characteristic::WriteNoResponse,
        }
    }
}

impl From<TestPhase> for TransportMode {
    fn from(phase: TestPhase) -> Self {
        match phase {
            TestPhase::Notifications => TransportMode::Notifications,
            TestPhase::Indications => TransportMode::Indications,
            TestPhase::WriteNoResponse => TransportMode::WriteNoResponse,
        }
    }
}

/// Peer subscriptions, as reported by CCCD writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportEnablement {
    pub notifications_enabled: bool,
    pub indications_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransferController {
    send_notifications: bool,
    send_indications: bool,
    send_write_no_response: bool,
    indication_in_flight: bool,
    /// Shared by notifications and writes without response.
    notify_buf: PayloadBuffer,
    indicate_buf: PayloadBuffer,
    notify_len: usize,
    indicate_len: usize,
    limit: TransferLimit,
    transfer_count: u32,
    stats: TransferStats,
}

impl TransferController {
    pub fn new(limit: TransferLimit) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.limit);
    }

    pub fn limit(&self) -> TransferLimit {
        self.limit
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Track the negotiated chunk sizes; takes effect on the next payload.
    pub fn set_chunk_sizes(&mut self, notify: u16, indicate: u16) {
        self.notify_len = notify as usize;
        self.indicate_len = indicate as usize;
    }

    pub fn notify_len(&self) -> usize {
        self.notify_len
    }

    pub fn indicate_len(&self) -> usize {
        self.indicate_len
    }

    pub fn arm_notifications(&mut self) {
        self.send_notifications = true;
        self.transfer_count = 0;
        self.notify_buf.generate(self.notify_len);
    }

    pub fn arm_indications(&mut self) {
        self.send_indications = true;
        self.transfer_count = 0;
        self.indicate_buf.generate(self.indicate_len);
    }

    pub fn arm_write_no_response(&mut self) {
        self.send_write_no_response = true;
        self.transfer_count = 0;
        self.notify_buf.generate(self.notify_len);
    }

    pub fn arm(&mut self, mode: TransportMode) {
        match mode {
            TransportMode::Notifications => self.arm_notifications(),
            TransportMode::Indications => self.arm_indications(),
            TransportMode::WriteNoResponse => self.arm_write_no_response(),
        }
    }

    pub fn disarm_all(&mut self) {
        self.send_notifications = false;
        self.send_indications = false;
        self.send_write_no_response = false;
    }

    pub fn is_streaming(&self) -> bool {
        self.send_notifications || self.send_indications || self.send_write_no_response
    }

    pub fn indication_in_flight(&self) -> bool {
        self.indication_in_flight
    }

    /// The send to attempt on this opportunity, if any mode may send.
    ///
    /// At most one indication is ever outstanding: no new one is offered
    /// until the previous one is confirmed.
    pub fn poll_send(&mut self, en: TransportEnablement) -> Option<(TransportMode, LinkCommand)> {
        let mode = if self.send_notifications && en.notifications_enabled {
            TransportMode::Notifications
        } else if self.send_write_no_response {
            TransportMode::WriteNoResponse
        } else if self.send_indications && en.indications_enabled && !self.indication_in_flight {
            TransportMode::Indications
        } else {
            return None;
        };

        let (buf, len) = match mode {
            TransportMode::Indications => (&mut self.indicate_buf, self.indicate_len),
            _ => (&mut self.notify_buf, self.notify_len),
        };
        if len == 0 {
            return None;
        }
        // chunk size renegotiated since the last generation
        if buf.len() != len {
            buf.generate(len);
        }
        let characteristic = mode.characteristic();
        let data = buf.as_slice().to_vec();
        let cmd = match mode {
            TransportMode::WriteNoResponse => LinkCommand::WriteWithoutResponse {
                characteristic,
                data,
            },
            _ => LinkCommand::SendNotification {
                characteristic,
                data,
            },
        };
        Some((mode, cmd))
    }

    /// The stack took an indication; it stays in flight until confirmed.
    pub fn on_indication_submitted(&mut self) {
        self.indication_in_flight = true;
    }

    /// Account a delivered payload and prepare the next one. For indications
    /// this is called on confirmation. Returns true when a fixed-count limit
    /// just disarmed the controller.
    pub fn on_send_accepted(&mut self, mode: TransportMode, bytes_sent: usize) -> bool {
        self.stats.add_operation(bytes_sent);
        trace!(?mode, bytes_sent, ops = self.stats.operation_count, "send accepted");
        match mode {
            TransportMode::Indications => {
                self.indication_in_flight = false;
                self.indicate_buf.generate(self.indicate_len);
            }
            _ => self.notify_buf.generate(self.notify_len),
        }
        if let TransferLimit::FixedCount(n) = self.limit {
            self.transfer_count += 1;
            if self.transfer_count >= n {
                debug!(count = self.transfer_count, "fixed transfer count reached");
                self.disarm_all();
                return true;
            }
        }
        false
    }

    /// The stack was busy. Nothing is retried here; the next opportunity
    /// event offers the same payload again.
    pub fn on_send_rejected(&mut self, mode: TransportMode) {
        trace!(?mode, "send rejected, link busy");
    }

    pub fn start_clock(&mut self, now: Ticks) {
        self.stats.start(now);
    }

    pub fn stop_clock(&mut self, now: Ticks) -> f64 {
        self.stats.stop(now)
    }

    pub fn clock_running(&self) -> bool {
        self.stats.is_running()
    }

    pub fn throughput_now(&self, now: Ticks) -> f64 {
        self.stats.current_bps(now)
    }

    /// Account received payload and count sequence anomalies in it.
    pub fn on_data_received(&mut self, data: &[u8]) -> u64 {
        self.stats.add_operation(data.len());
        let bad = integrity::validate(data);
        self.stats.add_invalid(bad);
        bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENABLED: TransportEnablement = TransportEnablement {
        notifications_enabled: true,
        indications_enabled: true,
    };

    fn controller(limit: TransferLimit) -> TransferController {
        let mut t = TransferController::new(limit);
        t.set_chunk_sizes(236, 244);
        t
    }

    fn payload(cmd: &LinkCommand) -> &[u8] {
        match cmd {
            LinkCommand::SendNotification { data, .. }
            | LinkCommand::WriteWithoutResponse { data, .. } => data,
            other => panic!("not a send: {:?}", other),
        }
    }

    #[test]
    fn nothing_to_send_until_armed() {
        let mut t = controller(TransferLimit::None);
        assert!(t.poll_send(ENABLED).is_none());
        t.arm_notifications();
        let (mode, cmd) = t.poll_send(ENABLED).unwrap();
        assert_eq!(mode, TransportMode::Notifications);
        assert_eq!(payload(&cmd).len(), 236);
    }

    #[test]
    fn notifications_need_subscription() {
        let mut t = controller(TransferLimit::None);
        t.arm_notifications();
        assert!(t.poll_send(TransportEnablement::default()).is_none());
    }

    #[test]
    fn accepted_send_advances_payload() {
        let mut t = controller(TransferLimit::None);
        t.arm_notifications();
        let (_, first) = t.poll_send(ENABLED).unwrap();
        let first = payload(&first).to_vec();
        assert!(!t.on_send_accepted(TransportMode::Notifications, first.len()));
        let (_, second) = t.poll_send(ENABLED).unwrap();
        let second = payload(&second);
        assert_eq!(second[0], first[first.len() - 1].wrapping_add(1));
        assert_eq!(t.stats().bits_sent, 236 * 8);
        assert_eq!(t.stats().operation_count, 1);
    }

    #[test]
    fn rejected_send_offers_same_payload() {
        let mut t = controller(TransferLimit::None);
        t.arm_write_no_response();
        let (mode, a) = t.poll_send(ENABLED).unwrap();
        assert!(matches!(a, LinkCommand::WriteWithoutResponse { .. }));
        t.on_send_rejected(mode);
        let (_, b) = t.poll_send(ENABLED).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.stats().operation_count, 0);
    }

    #[test]
    fn one_indication_in_flight() {
        let mut t = controller(TransferLimit::None);
        t.arm_indications();
        let (mode, cmd) = t.poll_send(ENABLED).unwrap();
        assert_eq!(mode, TransportMode::Indications);
        assert_eq!(payload(&cmd).len(), 244);
        t.on_indication_submitted();
        assert!(t.poll_send(ENABLED).is_none());

        t.on_send_accepted(TransportMode::Indications, 244);
        assert!(!t.indication_in_flight());
        assert!(t.poll_send(ENABLED).is_some());
        assert_eq!(t.stats().bits_sent, 244 * 8);
    }

    #[test]
    fn fixed_count_self_disarms() {
        let mut t = controller(TransferLimit::FixedCount(3));
        t.arm_notifications();
        assert!(!t.on_send_accepted(TransportMode::Notifications, 236));
        assert!(!t.on_send_accepted(TransportMode::Notifications, 236));
        assert!(t.on_send_accepted(TransportMode::Notifications, 236));
        assert!(!t.is_streaming());
        assert!(t.poll_send(ENABLED).is_none());
    }

    #[test]
    fn renegotiated_size_regenerates() {
        let mut t = controller(TransferLimit::None);
        t.arm_notifications();
        t.set_chunk_sizes(100, 244);
        let (_, cmd) = t.poll_send(ENABLED).unwrap();
        assert_eq!(payload(&cmd).len(), 100);
        assert_eq!(integrity::validate(payload(&cmd)), 0);
    }

    #[test]
    fn zero_chunk_never_sends() {
        let mut t = TransferController::new(TransferLimit::None);
        t.arm_notifications();
        assert!(t.poll_send(ENABLED).is_none());
    }

    #[test]
    fn clock_and_receive_accounting() {
        let mut t = controller(TransferLimit::None);
        t.start_clock(Ticks(0));
        assert_eq!(t.on_data_received(&[1, 2, 3, 4]), 0);
        assert_eq!(t.on_data_received(&[1, 2, 9, 10]), 1);
        assert_eq!(t.stats().invalid_byte_count, 1);
        assert_eq!(t.stop_clock(Ticks(32_768)), 64.0);
    }
}
