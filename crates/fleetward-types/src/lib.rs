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

//! fleetward-types: Shared type definitions for the fleetward ecosystem.
//!
//! This crate contains the status enums, query views and callback payloads
//! shared between the fleet engine, the HTTP surface, and managed routers.

#![warn(missing_docs)]

pub mod callback;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Returned when a stored enum label is not recognised.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending label.
    pub value: String,
}

macro_rules! labelled_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            /// Stable lowercase label, used for storage and the wire format.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

/// Connectivity state of a managed router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Never successfully probed.
    Pending,
    /// The last probe succeeded.
    Online,
    /// The device failed probing after going stale.
    Offline,
}

labelled_enum!(DeviceStatus, "device status", {
    Pending => "pending",
    Online => "online",
    Offline => "offline",
});

/// Lifecycle of one subscriber session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Seen in the most recent reconciliation cycle.
    Active,
    /// Closed. A row never leaves this state.
    Disconnected,
}

labelled_enum!(SessionStatus, "session status", {
    Active => "active",
    Disconnected => "disconnected",
});

/// How a subscriber is attached to the router. Assigned when a session is
/// ingested, never re-derived later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Captive-portal login.
    Hotspot,
    /// PPP over Ethernet dial-up.
    Pppoe,
    /// Framed user with a fixed assignment.
    Static,
    /// Anything the router or ledger did not classify.
    Unknown,
}

labelled_enum!(SessionKind, "session kind", {
    Hotspot => "hotspot",
    Pppoe => "pppoe",
    Static => "static",
    Unknown => "unknown",
});

/// Resource figures reported by a router's management API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU load, 0-100.
    pub cpu_percent: f64,
    /// Used memory as a share of total, 0-100.
    pub memory_percent: f64,
    /// Seconds since the router booted.
    pub uptime_secs: u64,
}

/// Operator links for reaching a router. Every link targets the tunnel
/// address; the public address a device reports is never used here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLinks {
    /// Web management console.
    pub web: String,
    /// SSH shell.
    pub shell: String,
    /// Raw management API.
    pub api: String,
}

/// Default SSH port on managed routers.
pub const SHELL_PORT: u16 = 22;

impl ConsoleLinks {
    /// Build links for a router at `tunnel` with the given service ports.
    pub fn for_tunnel(tunnel: Ipv4Addr, console_port: u16, api_port: u16) -> Self {
        Self {
            web: format!("http://{tunnel}:{console_port}"),
            shell: format!("ssh://{tunnel}:{SHELL_PORT}"),
            api: format!("http://{tunnel}:{api_port}"),
        }
    }
}

/// Per-device status as exposed to administrative collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    /// Unique identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Current connectivity state.
    pub status: DeviceStatus,
    /// Last successful probe.
    pub last_seen: Option<DateTime<Utc>>,
    /// CPU load from the last successful probe.
    pub cpu: Option<f64>,
    /// Memory usage from the last successful probe.
    pub memory: Option<f64>,
    /// Uptime from the last successful probe.
    pub uptime: Option<u64>,
    /// Assigned VPN address.
    pub tunnel_address: Option<Ipv4Addr>,
    /// Public TCP port forwarded to the device console.
    pub console_port: Option<u16>,
    /// Most recent probe or apply error.
    pub last_error: Option<String>,
    /// Operator links, present once a tunnel address exists.
    pub links: Option<ConsoleLinks>,
}

/// One subscriber session as exposed to collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    /// Row identifier. A reconnection gets a new one.
    pub id: Uuid,
    /// Router carrying the session.
    pub device_id: Uuid,
    /// Subscriber identity (login name).
    pub identity: String,
    /// Address handed to the subscriber.
    pub peer_address: String,
    /// Subscriber hardware address, when known.
    pub mac_address: Option<String>,
    /// Attachment type.
    pub kind: SessionKind,
    /// Active or disconnected.
    pub status: SessionStatus,
    /// When the row was first observed.
    pub first_seen: DateTime<Utc>,
    /// Last cycle that observed the session.
    pub last_seen: DateTime<Utc>,
}

/// Subscriber online flag plus its active sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberView {
    /// Subscriber identity (login name).
    pub identity: String,
    /// True iff at least one session is active.
    pub online: bool,
    /// Currently active sessions.
    pub sessions: Vec<SessionView>,
}

/// What the administrative layer needs to render setup instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingInfo {
    /// Device being onboarded.
    pub device_id: Uuid,
    /// Allocated VPN address.
    pub tunnel_address: Ipv4Addr,
    /// Prefix length of the tunnel subnet.
    pub tunnel_prefix: u8,
    /// The device's key, or a placeholder until it phones home.
    pub public_key: String,
    /// Hub public key the device must peer with.
    pub hub_public_key: String,
    /// Hub endpoint (host:port).
    pub hub_endpoint: String,
    /// Public TCP port forwarded to the device console.
    pub console_port: u16,
    /// Bearer token for the phone-home and heartbeat callbacks.
    pub callback_token: String,
}

/// A device error collected during a fleet sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    /// Device that failed.
    pub device_id: Uuid,
    /// Rendered error.
    pub error: String,
}

/// Outcome of one scheduler cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSummary {
    /// Cycle start.
    pub started_at: Option<DateTime<Utc>>,
    /// Cycle end.
    pub finished_at: Option<DateTime<Utc>>,
    /// Devices contacted.
    pub probed: usize,
    /// Devices online after the cycle.
    pub online: usize,
    /// Devices offline after the cycle.
    pub offline: usize,
    /// Devices without a tunnel address.
    pub skipped: usize,
    /// Probes that failed, timed out, or were abandoned.
    pub failed: usize,
    /// Active sessions fleet-wide after reconciliation.
    pub active_sessions: i64,
    /// Accounting rows that matched no device.
    pub orphaned_accounting: usize,
    /// Per-device errors.
    pub errors: Vec<DeviceError>,
}
