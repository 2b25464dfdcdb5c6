//! Controller settings, loaded from TOML and overridden from the command line.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::Ticks;
use crate::test::test_config::{TestConfig, TestPhase, TransferLimit};

/// Longest complete local name that fits next to the flags record in a
/// legacy advertisement.
pub const MAX_DEVICE_NAME_LEN: usize = 26;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fixed-count and fixed-duration limits are mutually exclusive")]
    ConflictingLimits,
    #[error("fixed transfer count must be non-zero")]
    ZeroCount,
    #[error("fixed transfer duration must be non-zero")]
    ZeroDuration,
    #[error("device name must be 1..={MAX_DEVICE_NAME_LEN} bytes, got {0}")]
    BadDeviceName(usize),
    #[error("test interval must be non-zero")]
    ZeroInterval,
    #[error("status refresh period must be non-zero")]
    ZeroRefresh,
    #[error("max MTU {0} is below the ATT minimum of 23")]
    MtuTooSmall(u16),
    #[error("{role} cannot drive a {phase} phase")]
    PhaseNotSupported { role: Role, phase: TestPhase },
}

/// GAP role of this controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Peripheral,
    Central,
}

impl Role {
    pub fn default_phase(self) -> Option<TestPhase> {
        match self {
            Role::Peripheral => Some(TestPhase::Notifications),
            Role::Central => None,
        }
    }

    /// Servers push notifications and indications, clients write.
    pub fn can_drive(self, phase: TestPhase) -> bool {
        match self {
            Role::Peripheral => phase != TestPhase::WriteNoResponse,
            Role::Central => phase == TestPhase::WriteNoResponse,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "peripheral" | "server" => Ok(Role::Peripheral),
            "central" | "client" => Ok(Role::Central),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Peripheral => "peripheral",
            Role::Central => "central",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Complete local name advertised by the peripheral and matched by the central.
    pub device_name: String,
    /// Seconds a running phase lasts when no limit is configured.
    pub test_interval_secs: u32,
    /// Fixed notification / write chunk size, used when it fits in MTU - 3.
    pub notify_chunk_override: Option<u16>,
    /// Fixed indication chunk size, used when smaller than MTU - 3.
    pub indicate_chunk_override: Option<u16>,
    pub limit: TransferLimit,
    /// Phase this side drives once connected. When unset the role picks:
    /// the peripheral streams notifications, the central only receives.
    pub phase: Option<TestPhase>,
    pub max_mtu: u16,
    pub tx_power_dbm: i16,
    pub refresh_period_ms: u32,
    /// Central only: cycle the PHY once after the first parameter update.
    pub change_phy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: "Throughput Tester".to_string(),
            test_interval_secs: 10,
            notify_chunk_override: None,
            indicate_chunk_override: None,
            limit: TransferLimit::None,
            phase: None,
            max_mtu: 250,
            tx_power_dbm: -50,
            refresh_period_ms: 1000,
            change_phy: false,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Settings =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(settings)
    }

    /// Apply `--count` / `--duration-ticks` on top of the file limit.
    /// Any combination that ends up naming both policies is rejected.
    pub fn apply_limit_flags(
        &mut self,
        count: Option<u32>,
        duration_ticks: Option<u64>,
    ) -> Result<(), ConfigError> {
        self.limit = match (count, duration_ticks, self.limit) {
            (Some(_), Some(_), _) => return Err(ConfigError::ConflictingLimits),
            (Some(_), None, TransferLimit::FixedDuration(_))
            | (None, Some(_), TransferLimit::FixedCount(_)) => {
                return Err(ConfigError::ConflictingLimits);
            }
            (Some(n), None, _) => TransferLimit::FixedCount(n),
            (None, Some(t), _) => TransferLimit::FixedDuration(Ticks(t)),
            (None, None, current) => current,
        };
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.limit {
            TransferLimit::FixedCount(0) => return Err(ConfigError::ZeroCount),
            TransferLimit::FixedDuration(Ticks(0)) => return Err(ConfigError::ZeroDuration),
            _ => {}
        }
        let n = self.device_name.len();
        if n == 0 || n > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::BadDeviceName(n));
        }
        if self.test_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        // a zero period is the stop-timer encoding; nothing would ever tick
        if self.refresh_period_ms == 0 {
            return Err(ConfigError::ZeroRefresh);
        }
        if self.max_mtu < 23 {
            return Err(ConfigError::MtuTooSmall(self.max_mtu));
        }
        Ok(())
    }

    /// `validate` plus the role/phase pairing.
    pub fn validate_for(&self, role: Role) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(phase) = self.phase
            && !role.can_drive(phase)
        {
            return Err(ConfigError::PhaseNotSupported { role, phase });
        }
        Ok(())
    }

    pub fn effective_phase(&self, role: Role) -> Option<TestPhase> {
        self.phase.or(role.default_phase())
    }

    pub fn test_config(&self, role: Role) -> TestConfig {
        TestConfig {
            phase: self.effective_phase(role),
            interval_secs: self.test_interval_secs,
            limit: self.limit,
        }
    }
}
