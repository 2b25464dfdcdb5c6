use std::str::FromStr;

use uuid::Uuid;

/// Throughput test GATT service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xbbb99e70_fff7_46cf_abc7_2d32c71820f2);

/// Opaque handle of the active link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle(pub u8);

/// Characteristics of the throughput service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Notifications,
    Indications,
    WriteNoResponse,
    /// Transfer start/stop signal: 0 = transfer running, 1 = transfer ended.
    DisplayRefresh,
}

impl Characteristic {
    pub fn handle(self) -> u16 {
        match self {
            Characteristic::Notifications => 22,
            Characteristic::Indications => 25,
            Characteristic::WriteNoResponse => 28,
            Characteristic::DisplayRefresh => 30,
        }
    }

    pub fn from_handle(handle: u16) -> Option<Self> {
        match handle {
            22 => Some(Characteristic::Notifications),
            25 => Some(Characteristic::Indications),
            28 => Some(Characteristic::WriteNoResponse),
            30 => Some(Characteristic::DisplayRefresh),
            _ => None,
        }
    }
}

/// CCCD flag values.
pub mod cccd {
    pub const NOTIFY: u8 = 0x01;
    pub const INDICATE: u8 = 0x02;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Notify,
    Indicate,
}

/// Soft timers the controller schedules on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerHandle {
    StatusRefresh,
    FixedTransferTime,
}

impl TimerHandle {
    pub fn to_raw(self) -> u8 {
        match self {
            TimerHandle::StatusRefresh => 0,
            TimerHandle::FixedTransferTime => 1,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TimerHandle::StatusRefresh),
            1 => Some(TimerHandle::FixedTransferTime),
            _ => None,
        }
    }
}

/// 48-bit device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Address(pub [u8; 6]);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for Address {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for b in out.iter_mut() {
            let p = parts.next().ok_or(())?;
            if p.len() != 2 {
                return Err(());
            }
            *b = u8::from_str_radix(p, 16).map_err(|_| ())?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Address(out))
    }
}

/// Advertising setup. Intervals in 0.625 ms units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub channel_map: u8,
    pub data: Vec<u8>,
    pub scan_response: Vec<u8>,
}

/// Scan setup. Interval and window in 0.625 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub interval: u16,
    pub window: u16,
    pub active: bool,
}

impl ScanParams {
    pub const DEFAULT: ScanParams = ScanParams {
        interval: 16,
        window: 16,
        active: true,
    };
}
