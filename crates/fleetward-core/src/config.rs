// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::peers::wgconf::decode_key;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetToml {
    pub tunnel: TunnelSection,
    pub console: ConsoleSection,
    pub schedule: ScheduleSection,
    pub sessions: SessionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub subnet: String,
    pub interface: String,
    pub config_path: String,
    pub private_key: String,
    pub listen_port: u16,
    pub endpoint: String,
    pub persistent_keepalive: u16,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            subnet: "10.99.0.0/16".into(),
            interface: "wg0".into(),
            config_path: "/etc/wireguard/wg0.conf".into(),
            private_key: String::new(),
            listen_port: 51820,
            endpoint: "vpn.example.com:51820".into(),
            persistent_keepalive: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSection {
    pub public_address: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            public_address: "0.0.0.0".into(),
            port_range_start: 20000,
            port_range_end: 29999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub cycle_deadline_secs: u64,
    pub max_workers: usize,
    pub staleness_secs: u64,
    /// Run a full peer resync every N cycles; 0 disables it.
    pub peer_resync_every: u32,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            probe_timeout_secs: 10,
            cycle_deadline_secs: 45,
            max_workers: 16,
            staleness_secs: 300,
            peer_resync_every: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub accounting_window_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            accounting_window_secs: 600,
            idle_timeout_secs: 900,
        }
    }
}

/// Upper bound for the accounting window and idle timeout (30 days).
const MAX_SESSION_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid tunnel subnet {0:?}")]
    Subnet(String),

    #[error("tunnel subnet {0} is too small to hold the hub and a device")]
    SubnetTooSmall(Ipv4Network),

    #[error("invalid public console address {0:?}")]
    PublicAddress(String),

    #[error("public console address must be set, 0.0.0.0 matches no traffic")]
    UnspecifiedPublicAddress,

    #[error("console port range {start}-{end} is empty")]
    PortRange { start: u16, end: u16 },

    #[error("hub private key is not a 32-byte base64 key")]
    PrivateKey,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} must be at most {max} seconds")]
    TooLarge { name: &'static str, max: u64 },
}

pub async fn load(path: &Path) -> Result<FleetToml, ConfigError> {
    debug!(path = %path.display(), "loading fleet config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: FleetToml = toml::from_str(&contents)?;
            info!(
                path = %path.display(),
                subnet = %config.tunnel.subnet,
                interface = %config.tunnel.interface,
                "loaded fleet config"
            );
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "fleet config not found, using defaults");
            Ok(FleetToml::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

/// Parsed, validated form of [`FleetToml`].
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub tunnel: TunnelSettings,
    pub console: ConsoleSettings,
    pub schedule: ScheduleSettings,
    pub sessions: SessionSettings,
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub subnet: Ipv4Network,
    pub interface: String,
    pub config_path: PathBuf,
    pub private_key: String,
    pub listen_port: u16,
    pub endpoint: String,
    pub persistent_keepalive: u16,
}

impl TunnelSettings {
    /// The first host address of the subnet belongs to the hub.
    pub fn hub_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()) + 1)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    pub public_address: Ipv4Addr,
    pub ports: RangeInclusive<u16>,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub cycle_deadline: Duration,
    pub max_workers: usize,
    pub staleness: Duration,
    pub peer_resync_every: u32,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub accounting_window: Duration,
    pub idle_timeout: Duration,
}

impl FleetToml {
    pub fn validate(&self) -> Result<FleetSettings, ConfigError> {
        let subnet: Ipv4Network = self
            .tunnel
            .subnet
            .parse()
            .map_err(|_| ConfigError::Subnet(self.tunnel.subnet.clone()))?;
        // network, hub, one device, broadcast
        if subnet.prefix() > 30 {
            return Err(ConfigError::SubnetTooSmall(subnet));
        }
        decode_key(&self.tunnel.private_key).map_err(|_| ConfigError::PrivateKey)?;

        let public_address: Ipv4Addr = self
            .console
            .public_address
            .parse()
            .map_err(|_| ConfigError::PublicAddress(self.console.public_address.clone()))?;
        if public_address.is_unspecified() {
            return Err(ConfigError::UnspecifiedPublicAddress);
        }
        let (start, end) = (self.console.port_range_start, self.console.port_range_end);
        if start == 0 || start > end {
            return Err(ConfigError::PortRange { start, end });
        }

        let schedule = &self.schedule;
        for (name, value) in [
            ("schedule.interval_secs", schedule.interval_secs),
            ("schedule.probe_timeout_secs", schedule.probe_timeout_secs),
            ("schedule.cycle_deadline_secs", schedule.cycle_deadline_secs),
            ("schedule.staleness_secs", schedule.staleness_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if schedule.max_workers == 0 {
            return Err(ConfigError::Zero("schedule.max_workers"));
        }
        for (name, value) in [
            ("sessions.accounting_window_secs", self.sessions.accounting_window_secs),
            ("sessions.idle_timeout_secs", self.sessions.idle_timeout_secs),
        ] {
            if value > MAX_SESSION_WINDOW_SECS {
                return Err(ConfigError::TooLarge {
                    name,
                    max: MAX_SESSION_WINDOW_SECS,
                });
            }
        }

        debug!(%subnet, %public_address, start, end, "fleet config validated");

        Ok(FleetSettings {
            tunnel: TunnelSettings {
                subnet,
                interface: self.tunnel.interface.clone(),
                config_path: PathBuf::from(&self.tunnel.config_path),
                private_key: self.tunnel.private_key.clone(),
                listen_port: self.tunnel.listen_port,
                endpoint: self.tunnel.endpoint.clone(),
                persistent_keepalive: self.tunnel.persistent_keepalive,
            },
            console: ConsoleSettings {
                public_address,
                ports: start..=end,
            },
            schedule: ScheduleSettings {
                interval: Duration::from_secs(schedule.interval_secs),
                probe_timeout: Duration::from_secs(schedule.probe_timeout_secs),
                cycle_deadline: Duration::from_secs(schedule.cycle_deadline_secs),
                max_workers: schedule.max_workers,
                staleness: Duration::from_secs(schedule.staleness_secs),
                peer_resync_every: schedule.peer_resync_every,
            },
            sessions: SessionSettings {
                accounting_window: Duration::from_secs(self.sessions.accounting_window_secs),
                idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            },
        })
    }
}
