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

//! Payloads exchanged with routers over the device callback endpoints.

use serde::{Deserialize, Serialize};

/// Sent by a router once it has generated its tunnel key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneHomeRequest {
    /// Base64 WireGuard public key.
    pub public_key: String,
    /// Address the router negotiated for itself, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_address: Option<String>,
}

/// Returned to the router so it can bring its side of the tunnel up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneHomeResponse {
    /// Address the router must configure, with prefix.
    pub address: String,
    /// Hub public key.
    pub hub_public_key: String,
    /// Hub endpoint (host:port).
    pub hub_endpoint: String,
    /// Ranges to route through the tunnel.
    pub allowed_ips: Vec<String>,
    /// Keepalive interval in seconds, zero to disable.
    pub persistent_keepalive: u16,
}

/// Periodic liveness report from a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Public address the router believes it has. Diagnostic only.
    #[serde(default)]
    pub public_address: Option<String>,
}
