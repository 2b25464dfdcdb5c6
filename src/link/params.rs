use crate::payload::PAYLOAD_CAPACITY;

/// ATT header bytes carried in every notification, indication or write.
pub const ATT_HEADER_LEN: u16 = 3;
/// L2CAP + ATT overhead inside the first link-layer PDU of a packet.
pub const PDU_OVERHEAD: u16 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phy {
    #[default]
    OneM,
    TwoM,
    CodedS8,
    CodedS2,
}

impl Phy {
    /// Bit used for the PHY in stack commands and events.
    pub fn to_raw(self) -> u8 {
        match self {
            Phy::OneM => 0x01,
            Phy::TwoM => 0x02,
            Phy::CodedS8 => 0x04,
            Phy::CodedS2 => 0x08,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Phy::OneM),
            0x02 => Some(Phy::TwoM),
            0x04 => Some(Phy::CodedS8),
            0x08 => Some(Phy::CodedS2),
            _ => None,
        }
    }

    /// Next step of the PHY test cycle 1M -> 2M -> S8 -> 1M.
    pub fn next_in_cycle(self) -> Phy {
        match self {
            Phy::OneM => Phy::TwoM,
            Phy::TwoM => Phy::CodedS8,
            Phy::CodedS8 | Phy::CodedS2 => Phy::OneM,
        }
    }

    /// Connection parameters suitable for running on this PHY.
    pub fn conn_params(self) -> ConnParams {
        match self {
            Phy::OneM => ConnParams::PHY_1M,
            Phy::TwoM => ConnParams::PHY_2M,
            Phy::CodedS8 | Phy::CodedS2 => ConnParams::PHY_CODED,
        }
    }
}

impl std::fmt::Display for Phy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phy::OneM => "1M",
            Phy::TwoM => "2M",
            Phy::CodedS8 => "S8",
            Phy::CodedS2 => "S2",
        })
    }
}

/// Connection parameter request. Intervals in 1.25 ms units, timeout in 10 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub slave_latency: u16,
    pub supervision_timeout: u16,
}

impl ConnParams {
    pub const PHY_1M: ConnParams = ConnParams {
        min_interval: 40,
        max_interval: 40,
        slave_latency: 0,
        supervision_timeout: 100,
    };
    pub const PHY_2M: ConnParams = ConnParams {
        min_interval: 20,
        max_interval: 20,
        slave_latency: 0,
        supervision_timeout: 100,
    };
    // LE Coded requires an interval of at least 40 ms
    pub const PHY_CODED: ConnParams = ConnParams {
        min_interval: 160,
        max_interval: 160,
        slave_latency: 0,
        supervision_timeout: 200,
    };
}

/// Convert a raw interval (1.25 ms units) to whole milliseconds.
pub fn interval_raw_to_ms(raw: u16) -> u32 {
    raw as u32 * 5 / 4
}

/// Negotiated link state and the chunk sizes derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkParameters {
    pub mtu: u16,
    pub ptu_size: u16,
    pub phy: Phy,
    pub conn_interval_ms: u32,
    max_notify_chunk: u16,
    max_indicate_chunk: u16,
    notify_override: Option<u16>,
    indicate_override: Option<u16>,
}

impl LinkParameters {
    pub fn new(notify_override: Option<u16>, indicate_override: Option<u16>) -> Self {
        Self {
            notify_override: notify_override.filter(|&n| n > 0),
            indicate_override: indicate_override.filter(|&n| n > 0),
            ..Self::default()
        }
    }

    /// Back to the pre-connection state, keeping the configured overrides.
    pub fn reset(&mut self) {
        *self = Self::new(self.notify_override, self.indicate_override);
    }

    /// Bytes per notification or write-without-response.
    pub fn max_notify_chunk(&self) -> u16 {
        self.max_notify_chunk
    }

    /// Bytes per indication.
    pub fn max_indicate_chunk(&self) -> u16 {
        self.max_indicate_chunk
    }

    pub fn update_from_mtu_exchange(&mut self, mtu: u16) -> u16 {
        self.mtu = mtu;
        self.recompute();
        self.max_notify_chunk
    }

    pub fn update_from_connection_parameters(&mut self, ptu_size: u16, interval_raw: u16) -> u16 {
        self.ptu_size = ptu_size;
        self.conn_interval_ms = interval_raw_to_ms(interval_raw);
        self.recompute();
        self.max_notify_chunk
    }

    fn recompute(&mut self) {
        if let Some(n) = indicate_chunk(self.mtu, self.indicate_override) {
            self.max_indicate_chunk = clamp_capacity(n);
        }
        if let Some(n) = notify_chunk(self.mtu, self.ptu_size, self.notify_override) {
            self.max_notify_chunk = clamp_capacity(n);
        }
    }
}

fn clamp_capacity(n: u16) -> u16 {
    n.min(PAYLOAD_CAPACITY as u16)
}

/// Largest ATT value that fits the MTU, or `None` before the MTU is known.
fn att_payload(mtu: u16) -> Option<u16> {
    mtu.checked_sub(ATT_HEADER_LEN).filter(|&n| n > 0)
}

/// Notification chunk size for the given MTU / PTU, or `None` when it cannot
/// be derived yet and the previous value must stand.
///
/// Packs as many whole PTUs as fit into one ATT packet: the first PTU loses
/// the 7 header bytes, every following one is filled completely.
pub fn notify_chunk(mtu: u16, ptu_size: u16, fixed: Option<u16>) -> Option<u16> {
    if let (Some(n), Some(max)) = (fixed, att_payload(mtu))
        && n <= max
    {
        return Some(n);
    }
    if mtu == 0 || ptu_size == 0 {
        return None;
    }
    let chunk = if ptu_size <= mtu {
        let (mtu, ptu) = (mtu as u32, ptu_size as u32);
        let first = ptu.saturating_sub(PDU_OVERHEAD as u32);
        let rest = (mtu + PDU_OVERHEAD as u32 - ATT_HEADER_LEN as u32 - ptu) / ptu * ptu;
        (first + rest) as u16
    } else if ptu_size - mtu <= 4 {
        ptu_size.saturating_sub(PDU_OVERHEAD)
    } else {
        mtu.saturating_sub(ATT_HEADER_LEN)
    };
    Some(chunk).filter(|&n| n > 0)
}

/// Indication chunk size: MTU - 3, or a smaller fixed size.
pub fn indicate_chunk(mtu: u16, fixed: Option<u16>) -> Option<u16> {
    let max = att_payload(mtu)?;
    Some(match fixed {
        Some(n) if n <= max => n,
        _ => max,
    })
}
