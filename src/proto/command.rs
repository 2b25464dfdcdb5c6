use crate::link::params::{ConnParams, Phy};

use super::types::{
    AdvParams, Address, Characteristic, ConnectionHandle, ScanParams, SubscriptionKind,
    TimerHandle,
};

/// Commands issued to the link stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    // ---- Data ----
    /// Notification or indication, depending on the characteristic.
    SendNotification {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    WriteWithoutResponse {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    WriteCccd {
        characteristic: Characteristic,
        flags: u8,
    },
    ConfirmIndicationReceipt {
        connection: ConnectionHandle,
    },

    // ---- Link ----
    SetConnectionParameters(ConnParams),
    SetPhy(Phy),
    SetMaxMtu(u16),
    SetTxPower(i16),
    ReadRssi,

    // ---- GAP ----
    SetAdvertising(AdvParams),
    StartScan(ScanParams),
    StopScan,
    Connect(Address),

    // ---- Timers ----
    /// A zero period stops the timer.
    SchedulePeriodicTick {
        period_ms: u32,
        handle: TimerHandle,
        single_shot: bool,
    },
}

impl LinkCommand {
    /// Per-packet stream sends; everything else is a boundary command that
    /// must eventually be accepted.
    pub fn is_stream_send(&self) -> bool {
        match self {
            LinkCommand::SendNotification { characteristic, .. }
            | LinkCommand::WriteWithoutResponse { characteristic, .. } => {
                *characteristic != Characteristic::DisplayRefresh
            }
            _ => false,
        }
    }
}

/// Answer of the stack to a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Accepted,
    /// Out of buffers; try again on a later event.
    Busy,
}

/// Events raised by the link stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    SystemBoot,
    ConnectionOpened {
        connection: ConnectionHandle,
        address: Address,
    },
    ConnectionClosed {
        reason: u16,
    },
    MtuExchanged {
        connection: ConnectionHandle,
        mtu: u16,
    },
    ConnectionParametersUpdated {
        ptu_size: u16,
        interval_raw: u16,
    },
    PhyStatusChanged {
        phy: Phy,
    },
    CharacteristicSubscriptionChanged {
        characteristic: Characteristic,
        enabled: bool,
        kind: SubscriptionKind,
    },
    /// Indication acknowledged by the peer.
    SendConfirmed {
        characteristic: Characteristic,
    },
    DataReceived {
        characteristic: Characteristic,
        data: Vec<u8>,
        indication: bool,
    },
    PeriodicTick {
        handle: TimerHandle,
    },
    ScanAdvertisementObserved {
        address: Address,
        adv_data: Vec<u8>,
    },
    /// A GATT client procedure (descriptor write) finished.
    ProcedureCompleted,
    RssiReported {
        rssi: i8,
    },
    /// Transmit buffers freed up; a send opportunity.
    LinkIdle,
}
