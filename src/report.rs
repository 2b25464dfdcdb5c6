use tracing::{info, warn};

use crate::config::Role;
use crate::link::params::{LinkParameters, Phy};
use crate::stats::TransferStats;
use crate::transfer::TransportEnablement;

/// Which side of the transfer produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Summary of one finished transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// true = PASS, false = FAIL
    pub pass: bool,
    pub direction: Direction,
    /// phase label, e.g. "notifications"; "peer" when the peer drove it
    pub mode: String,

    pub bits: u64,
    pub operations: u64,
    /// sequence anomalies seen by the receiver
    pub invalid_bytes: u64,

    pub elapsed_ticks: u64,
    pub throughput_bps: f64,

    /// reason for failure (optional, e.g. "no data", "invalid bytes")
    pub reason: Option<String>,
}

impl TestReport {
    pub fn from_stats(direction: Direction, mode: impl Into<String>, stats: &TransferStats) -> Self {
        let pass = stats.operation_count > 0 && stats.invalid_byte_count == 0;
        let reason = if pass {
            None
        } else if stats.operation_count == 0 {
            Some("no data".into())
        } else {
            Some("invalid bytes".into())
        };
        Self {
            pass,
            direction,
            mode: mode.into(),
            bits: stats.bits_sent,
            operations: stats.operation_count,
            invalid_bytes: stats.invalid_byte_count,
            elapsed_ticks: stats.elapsed_ticks,
            throughput_bps: stats.throughput_bps,
            reason,
        }
    }

    pub fn verdict(&self) -> &'static str {
        match self.pass {
            true => "PASS",
            false => "FAIL",
        }
    }

    pub fn log(&self) {
        let reason = self.reason.as_deref().unwrap_or("none");
        if self.pass {
            info!(
                verdict = self.verdict(),
                direction = ?self.direction,
                mode = %self.mode,
                bits = self.bits,
                ops = self.operations,
                invalid = self.invalid_bytes,
                elapsed_ticks = self.elapsed_ticks,
                bps = self.throughput_bps as u64,
                "transfer report"
            );
        } else {
            warn!(
                verdict = self.verdict(),
                direction = ?self.direction,
                mode = %self.mode,
                bits = self.bits,
                ops = self.operations,
                invalid = self.invalid_bytes,
                reason,
                "transfer report"
            );
        }
    }
}

impl std::fmt::Display for TestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:?} bits={} ops={} invalid={} elapsed_ms={} kbps={:.1}",
            self.verdict(),
            self.mode,
            self.direction,
            self.bits,
            self.operations,
            self.invalid_bytes,
            self.elapsed_ticks * 1000 / crate::stats::TICKS_PER_SECOND,
            self.throughput_bps / 1000.0,
        )?;
        if let Some(r) = &self.reason {
            write!(f, " reason={r}")?;
        }
        Ok(())
    }
}

/// One status refresh worth of link and transfer state.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub role: Role,
    pub connected: bool,
    pub interval_ms: u32,
    pub ptu: u16,
    pub mtu: u16,
    pub chunk: u16,
    pub phy: Phy,
    pub enablement: TransportEnablement,
    pub throughput_bps: f64,
    pub operations: u64,
    pub invalid_bytes: u64,
    pub rssi: Option<i8>,
}

impl StatusSnapshot {
    pub fn new(
        role: Role,
        connected: bool,
        params: &LinkParameters,
        enablement: TransportEnablement,
        stats: &TransferStats,
        throughput_bps: f64,
        rssi: Option<i8>,
    ) -> Self {
        Self {
            role,
            connected,
            interval_ms: params.conn_interval_ms,
            ptu: params.ptu_size,
            mtu: params.mtu,
            chunk: params.max_notify_chunk(),
            phy: params.phy,
            enablement,
            throughput_bps,
            operations: stats.operation_count,
            invalid_bytes: stats.invalid_byte_count,
            rssi,
        }
    }

    pub fn log(&self) {
        info!(
            role = %self.role,
            connected = self.connected,
            interval_ms = self.interval_ms,
            ptu = self.ptu,
            mtu = self.mtu,
            chunk = self.chunk,
            phy = %self.phy,
            notify = self.enablement.notifications_enabled,
            indicate = self.enablement.indications_enabled,
            kbps = self.throughput_bps / 1000.0,
            ops = self.operations,
            invalid = self.invalid_bytes,
            rssi = ?self.rssi,
            "status"
        );
    }
}
