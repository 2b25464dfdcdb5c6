// Line codec for the host link: `CMD`/`EVT`/`RSP` tag followed by key=value pairs.
use std::{collections::BTreeMap, str::FromStr};

use thiserror::Error;

use super::command::{CommandStatus, LinkCommand, LinkEvent};
use super::types::{
    AdvParams, Address, Characteristic, ConnectionHandle, ScanParams, SubscriptionKind,
    TimerHandle,
};
use crate::link::params::{ConnParams, Phy};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing tag")]
    MissingTag,
    #[error("malformed key=value pair: {0}")]
    BadPair(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid integer for {0}: {1}")]
    BadInt(&'static str, String),
    #[error("invalid enum for {0}: {1}")]
    BadEnum(&'static str, String),
    #[error("invalid hex for {0}")]
    BadHex(&'static str),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

/// Anything that can travel over the host link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLine {
    Command(LinkCommand),
    Event(LinkEvent),
    Response(CommandStatus),
}

macro_rules! push_pair {
    ($out:ident, $k:literal, $v:expr) => {{
        $out.push(' ');
        $out.push_str($k);
        $out.push('=');
        $out.push_str(&$v.to_string());
    }};
}

/// Serialize a command to a CRLF-terminated line.
pub fn format_command(cmd: &LinkCommand) -> String {
    use LinkCommand::*;
    let mut out = String::from("CMD");

    match cmd {
        SendNotification {
            characteristic,
            data,
        } => {
            out.push_str(" NOTIFY");
            push_pair!(out, "chr", characteristic.handle());
            push_pair!(out, "data", hex::encode(data));
        }
        WriteWithoutResponse {
            characteristic,
            data,
        } => {
            out.push_str(" WRITE NR");
            push_pair!(out, "chr", characteristic.handle());
            push_pair!(out, "data", hex::encode(data));
        }
        WriteCccd {
            characteristic,
            flags,
        } => {
            out.push_str(" WRITE CCCD");
            push_pair!(out, "chr", characteristic.handle());
            push_pair!(out, "flags", flags);
        }
        ConfirmIndicationReceipt { connection } => {
            out.push_str(" CONFIRM");
            push_pair!(out, "conn", connection.0);
        }
        SetConnectionParameters(p) => {
            out.push_str(" CONN PARAMS");
            push_pair!(out, "min", p.min_interval);
            push_pair!(out, "max", p.max_interval);
            push_pair!(out, "latency", p.slave_latency);
            push_pair!(out, "timeout", p.supervision_timeout);
        }
        SetPhy(phy) => {
            out.push_str(" SET PHY");
            push_pair!(out, "phy", phy.to_raw());
        }
        SetMaxMtu(mtu) => {
            out.push_str(" SET MTU");
            push_pair!(out, "mtu", mtu);
        }
        SetTxPower(dbm) => {
            out.push_str(" TX POWER");
            push_pair!(out, "dbm", dbm);
        }
        ReadRssi => out.push_str(" RSSI"),
        SetAdvertising(a) => {
            out.push_str(" ADVERTISE");
            push_pair!(out, "min", a.interval_min);
            push_pair!(out, "max", a.interval_max);
            push_pair!(out, "channels", a.channel_map);
            push_pair!(out, "data", hex::encode(&a.data));
            push_pair!(out, "rsp", hex::encode(&a.scan_response));
        }
        StartScan(s) => {
            out.push_str(" SCAN START");
            push_pair!(out, "interval", s.interval);
            push_pair!(out, "window", s.window);
            push_pair!(out, "active", s.active as u8);
        }
        StopScan => out.push_str(" SCAN STOP"),
        Connect(addr) => {
            out.push_str(" CONNECT");
            push_pair!(out, "addr", addr);
        }
        SchedulePeriodicTick {
            period_ms,
            handle,
            single_shot,
        } => {
            out.push_str(" TIMER");
            push_pair!(out, "period_ms", period_ms);
            push_pair!(out, "handle", handle.to_raw());
            push_pair!(out, "single", *single_shot as u8);
        }
    }

    out.push_str("\r\n");
    out
}

/// Serialize an event to a CRLF-terminated line.
pub fn format_event(evt: &LinkEvent) -> String {
    use LinkEvent::*;
    let mut out = String::from("EVT");

    match evt {
        SystemBoot => out.push_str(" BOOT"),
        ConnectionOpened {
            connection,
            address,
        } => {
            out.push_str(" CONN OPENED");
            push_pair!(out, "conn", connection.0);
            push_pair!(out, "addr", address);
        }
        ConnectionClosed { reason } => {
            out.push_str(" CONN CLOSED");
            push_pair!(out, "reason", reason);
        }
        MtuExchanged { connection, mtu } => {
            out.push_str(" MTU");
            push_pair!(out, "conn", connection.0);
            push_pair!(out, "mtu", mtu);
        }
        ConnectionParametersUpdated {
            ptu_size,
            interval_raw,
        } => {
            out.push_str(" CONN PARAMS");
            push_pair!(out, "ptu", ptu_size);
            push_pair!(out, "interval", interval_raw);
        }
        PhyStatusChanged { phy } => {
            out.push_str(" PHY");
            push_pair!(out, "phy", phy.to_raw());
        }
        CharacteristicSubscriptionChanged {
            characteristic,
            enabled,
            kind,
        } => {
            out.push_str(" SUBSCRIBE");
            push_pair!(out, "chr", characteristic.handle());
            push_pair!(out, "enabled", *enabled as u8);
            push_pair!(
                out,
                "kind",
                match kind {
                    SubscriptionKind::Notify => "notify",
                    SubscriptionKind::Indicate => "indicate",
                }
            );
        }
        SendConfirmed { characteristic } => {
            out.push_str(" CONFIRMED");
            push_pair!(out, "chr", characteristic.handle());
        }
        DataReceived {
            characteristic,
            data,
            indication,
        } => {
            out.push_str(" DATA");
            push_pair!(out, "chr", characteristic.handle());
            push_pair!(out, "data", hex::encode(data));
            push_pair!(out, "indication", *indication as u8);
        }
        PeriodicTick { handle } => {
            out.push_str(" TICK");
            push_pair!(out, "handle", handle.to_raw());
        }
        ScanAdvertisementObserved { address, adv_data } => {
            out.push_str(" SCAN");
            push_pair!(out, "addr", address);
            push_pair!(out, "data", hex::encode(adv_data));
        }
        ProcedureCompleted => out.push_str(" PROC DONE"),
        RssiReported { rssi } => {
            out.push_str(" RSSI");
            push_pair!(out, "rssi", rssi);
        }
        LinkIdle => out.push_str(" IDLE"),
    }

    out.push_str("\r\n");
    out
}

pub fn format_response(status: CommandStatus) -> String {
    let mut out = String::from("RSP");
    push_pair!(
        out,
        "status",
        match status {
            CommandStatus::Accepted => "ok",
            CommandStatus::Busy => "busy",
        }
    );
    out.push_str("\r\n");
    out
}

/// Parse a CR/LF-terminated line from either side of the host link.
pub fn parse_line(line: &str) -> Result<HostLine, ParseError> {
    let s = line.trim_matches(|c| c == '\r' || c == '\n' || c == ' ');
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    // Everything before the first k=v token is the (multi-word) tag.
    let tokens: Vec<&str> = s.split_whitespace().collect();
    let kv_start = tokens
        .iter()
        .position(|t| t.contains('='))
        .unwrap_or(tokens.len());
    if kv_start == 0 {
        return Err(ParseError::MissingTag);
    }
    let tag = tokens[..kv_start].join(" ");
    let mut map = BTreeMap::<String, String>::new();

    for &tok in &tokens[kv_start..] {
        let (k, v) = tok
            .split_once('=')
            .ok_or_else(|| ParseError::BadPair(tok.to_string()))?;
        map.insert(k.to_string(), v.to_string());
    }

    match tag.split_once(' ') {
        Some(("CMD", rest)) => parse_command(rest, &map).map(HostLine::Command),
        Some(("EVT", rest)) => parse_event(rest, &map).map(HostLine::Event),
        None if tag == "RSP" => match req_s(&map, "status")? {
            "ok" => Ok(HostLine::Response(CommandStatus::Accepted)),
            "busy" => Ok(HostLine::Response(CommandStatus::Busy)),
            other => Err(ParseError::BadEnum("status", other.to_string())),
        },
        _ => Err(ParseError::UnknownTag(tag)),
    }
}

fn parse_command(tag: &str, map: &BTreeMap<String, String>) -> Result<LinkCommand, ParseError> {
    use LinkCommand::*;

    Ok(match tag {
        "NOTIFY" => SendNotification {
            characteristic: req_chr(map, "chr")?,
            data: req_hex(map, "data")?,
        },
        "WRITE NR" => WriteWithoutResponse {
            characteristic: req_chr(map, "chr")?,
            data: req_hex(map, "data")?,
        },
        "WRITE CCCD" => WriteCccd {
            characteristic: req_chr(map, "chr")?,
            flags: req_int(map, "flags")?,
        },
        "CONFIRM" => ConfirmIndicationReceipt {
            connection: ConnectionHandle(req_int(map, "conn")?),
        },
        "CONN PARAMS" => SetConnectionParameters(ConnParams {
            min_interval: req_int(map, "min")?,
            max_interval: req_int(map, "max")?,
            slave_latency: req_int(map, "latency")?,
            supervision_timeout: req_int(map, "timeout")?,
        }),
        "SET PHY" => SetPhy(req_phy(map, "phy")?),
        "SET MTU" => SetMaxMtu(req_int(map, "mtu")?),
        "TX POWER" => SetTxPower(req_int(map, "dbm")?),
        "RSSI" => ReadRssi,
        "ADVERTISE" => SetAdvertising(AdvParams {
            interval_min: req_int(map, "min")?,
            interval_max: req_int(map, "max")?,
            channel_map: req_int(map, "channels")?,
            data: req_hex(map, "data")?,
            scan_response: req_hex(map, "rsp")?,
        }),
        "SCAN START" => StartScan(ScanParams {
            interval: req_int(map, "interval")?,
            window: req_int(map, "window")?,
            active: req_bool(map, "active")?,
        }),
        "SCAN STOP" => StopScan,
        "CONNECT" => Connect(req_addr(map, "addr")?),
        "TIMER" => SchedulePeriodicTick {
            period_ms: req_int(map, "period_ms")?,
            handle: req_timer(map, "handle")?,
            single_shot: req_bool(map, "single")?,
        },
        _ => return Err(ParseError::UnknownTag(format!("CMD {tag}"))),
    })
}

fn parse_event(tag: &str, map: &BTreeMap<String, String>) -> Result<LinkEvent, ParseError> {
    use LinkEvent::*;

    Ok(match tag {
        "BOOT" => SystemBoot,
        "CONN OPENED" => ConnectionOpened {
            connection: ConnectionHandle(req_int(map, "conn")?),
            address: req_addr(map, "addr")?,
        },
        "CONN CLOSED" => ConnectionClosed {
            reason: req_int(map, "reason")?,
        },
        "MTU" => MtuExchanged {
            connection: ConnectionHandle(req_int(map, "conn")?),
            mtu: req_int(map, "mtu")?,
        },
        "CONN PARAMS" => ConnectionParametersUpdated {
            ptu_size: req_int(map, "ptu")?,
            interval_raw: req_int(map, "interval")?,
        },
        "PHY" => PhyStatusChanged {
            phy: req_phy(map, "phy")?,
        },
        "SUBSCRIBE" => CharacteristicSubscriptionChanged {
            characteristic: req_chr(map, "chr")?,
            enabled: req_bool(map, "enabled")?,
            kind: match req_s(map, "kind")? {
                "notify" => SubscriptionKind::Notify,
                "indicate" => SubscriptionKind::Indicate,
                other => return Err(ParseError::BadEnum("kind", other.to_string())),
            },
        },
        "CONFIRMED" => SendConfirmed {
            characteristic: req_chr(map, "chr")?,
        },
        "DATA" => DataReceived {
            characteristic: req_chr(map, "chr")?,
            data: req_hex(map, "data")?,
            indication: req_bool(map, "indication")?,
        },
        "TICK" => PeriodicTick {
            handle: req_timer(map, "handle")?,
        },
        "SCAN" => ScanAdvertisementObserved {
            address: req_addr(map, "addr")?,
            adv_data: req_hex(map, "data")?,
        },
        "PROC DONE" => ProcedureCompleted,
        "RSSI" => RssiReported {
            rssi: req_int(map, "rssi")?,
        },
        "IDLE" => LinkIdle,
        _ => return Err(ParseError::UnknownTag(format!("EVT {tag}"))),
    })
}

/* ---------- helpers ---------- */

fn req_s<'a>(map: &'a BTreeMap<String, String>, k: &'static str) -> Result<&'a str, ParseError> {
    map.get(k)
        .map(|s| s.as_str())
        .ok_or(ParseError::MissingField(k))
}

fn req_int<T: FromStr>(map: &BTreeMap<String, String>, k: &'static str) -> Result<T, ParseError> {
    let v = req_s(map, k)?;
    v.parse::<T>()
        .map_err(|_| ParseError::BadInt(k, v.to_string()))
}

fn req_bool(map: &BTreeMap<String, String>, k: &'static str) -> Result<bool, ParseError> {
    match req_s(map, k)? {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ParseError::BadEnum(k, other.to_string())),
    }
}

fn req_hex(map: &BTreeMap<String, String>, k: &'static str) -> Result<Vec<u8>, ParseError> {
    hex::decode(req_s(map, k)?).map_err(|_| ParseError::BadHex(k))
}

fn req_addr(map: &BTreeMap<String, String>, k: &'static str) -> Result<Address, ParseError> {
    let v = req_s(map, k)?;
    Address::from_str(v).map_err(|_| ParseError::BadEnum(k, v.to_string()))
}

fn req_chr(map: &BTreeMap<String, String>, k: &'static str) -> Result<Characteristic, ParseError> {
    let handle: u16 = req_int(map, k)?;
    Characteristic::from_handle(handle).ok_or_else(|| ParseError::BadEnum(k, handle.to_string()))
}

fn req_phy(map: &BTreeMap<String, String>, k: &'static str) -> Result<Phy, ParseError> {
    let raw: u8 = req_int(map, k)?;
    Phy::from_raw(raw).ok_or_else(|| ParseError::BadEnum(k, raw.to_string()))
}

fn req_timer(map: &BTreeMap<String, String>, k: &'static str) -> Result<TimerHandle, ParseError> {
    let raw: u8 = req_int(map, k)?;
    TimerHandle::from_raw(raw).ok_or_else(|| ParseError::BadEnum(k, raw.to_string()))
}

/* ---------- tests ---------- */
