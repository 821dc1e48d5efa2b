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

//! Router management API client.
//!
//! Routers expose a RouterOS-style REST API (`/rest/...`, basic auth) on
//! their management port. Every request goes to the tunnel address; a device
//! without one cannot produce a [`ProbeTarget`].

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use fleetward_types::{ResourceSnapshot, SessionKind};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::credentials::{CredentialCipher, CredentialError};
use crate::db::Device;
use crate::sessions::LiveSession;
use crate::status::ProbeOutcome;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("device rejected credentials (401)")]
    Unauthorized,

    #[error("device returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("stored credentials unusable: {0}")]
    Credentials(#[from] CredentialError),

    #[error("no tunnel address assigned")]
    NoTunnelAddress,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProbeError {
    /// Errors that retrying on the next cycle cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Credentials(_) | Self::NoTunnelAddress)
    }

    pub fn into_outcome(self) -> ProbeOutcome {
        if self.is_fatal() {
            ProbeOutcome::Fatal(self.to_string())
        } else {
            ProbeOutcome::Recoverable(self.to_string())
        }
    }
}

/// Where and how to reach one router. Only constructible from a tunnel
/// address.
#[derive(Clone)]
pub struct ProbeTarget {
    pub device_id: Uuid,
    pub address: Ipv4Addr,
    pub port: u16,
    pub username: String,
    password: String,
}

impl std::fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTarget")
            .field("device_id", &self.device_id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProbeTarget {
    pub fn new(device_id: Uuid, address: Ipv4Addr, port: u16, username: &str, password: &str) -> Self {
        Self {
            device_id,
            address,
            port,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn for_device(device: &Device, cipher: &CredentialCipher) -> Result<Self, ProbeError> {
        let address = device.tunnel_address.ok_or(ProbeError::NoTunnelAddress)?;
        let password = cipher.open(&device.api_password)?;
        Ok(Self::new(device.id, address, device.api_port, &device.api_username, &password))
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}/rest/{path}", self.address, self.port)
    }
}

/// The vendor management protocol, as far as the engine needs it.
pub trait Management: Send + Sync + 'static {
    fn resources(
        &self,
        target: &ProbeTarget,
    ) -> impl Future<Output = Result<ResourceSnapshot, ProbeError>> + Send;

    fn active_sessions(
        &self,
        target: &ProbeTarget,
    ) -> impl Future<Output = Result<Vec<LiveSession>, ProbeError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RouterOsClient {
    http: Client,
}

impl RouterOsClient {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    #[tracing::instrument(skip(self, target), fields(device_id = %target.device_id, address = %target.address))]
    async fn get<T: DeserializeOwned>(&self, target: &ProbeTarget, path: &str) -> Result<T, ProbeError> {
        let url = target.url(path);
        debug!(url = %url, "querying management api");

        let resp = self
            .http
            .get(&url)
            .basic_auth(&target.username, Some(&target.password))
            .send()
            .await?;

        let status = resp.status().as_u16();
        match status {
            200 => resp
                .json::<T>()
                .await
                .map_err(|e| ProbeError::Decode(e.to_string())),
            401 => {
                warn!("management api returned 401");
                Err(ProbeError::Unauthorized)
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                warn!(status, body = %body, "management api returned unexpected status");
                Err(ProbeError::Status { status, body })
            }
        }
    }
}

impl Management for RouterOsClient {
    async fn resources(&self, target: &ProbeTarget) -> Result<ResourceSnapshot, ProbeError> {
        let raw: RawResource = self.get(target, "system/resource").await?;
        raw.into_snapshot()
    }

    async fn active_sessions(&self, target: &ProbeTarget) -> Result<Vec<LiveSession>, ProbeError> {
        let (hotspot, ppp) = futures::future::try_join(
            self.get::<Vec<RawHotspotActive>>(target, "ip/hotspot/active"),
            self.get::<Vec<RawPppActive>>(target, "ppp/active"),
        )
        .await?;

        let sessions: Vec<LiveSession> = hotspot
            .into_iter()
            .filter_map(RawHotspotActive::into_live)
            .chain(ppp.into_iter().filter_map(RawPppActive::into_live))
            .collect();

        debug!(
            device_id = %target.device_id,
            session_count = sessions.len(),
            "enumerated live sessions"
        );
        Ok(sessions)
    }
}

// -- Wire formats --

// RouterOS REST renders numbers as strings; accept either.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(rename = "cpu-load", default)]
    cpu_load: Value,
    #[serde(rename = "free-memory", default)]
    free_memory: Value,
    #[serde(rename = "total-memory", default)]
    total_memory: Value,
    #[serde(default)]
    uptime: Value,
}

impl RawResource {
    fn into_snapshot(self) -> Result<ResourceSnapshot, ProbeError> {
        let cpu = as_u64(&self.cpu_load)
            .ok_or_else(|| ProbeError::Decode(format!("cpu-load: {}", self.cpu_load)))?;
        let total = as_u64(&self.total_memory)
            .filter(|t| *t > 0)
            .ok_or_else(|| ProbeError::Decode(format!("total-memory: {}", self.total_memory)))?;
        let free = as_u64(&self.free_memory)
            .ok_or_else(|| ProbeError::Decode(format!("free-memory: {}", self.free_memory)))?;
        let uptime = match &self.uptime {
            Value::String(s) => parse_uptime(s),
            other => as_u64(other),
        }
        .ok_or_else(|| ProbeError::Decode(format!("uptime: {}", self.uptime)))?;

        let used = total.saturating_sub(free);
        Ok(ResourceSnapshot {
            cpu_percent: cpu.min(100) as f64,
            memory_percent: (used as f64 / total as f64 * 1000.0).round() / 10.0,
            uptime_secs: uptime,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawHotspotActive {
    #[serde(default)]
    user: String,
    #[serde(default)]
    address: String,
    #[serde(rename = "mac-address", default)]
    mac_address: Option<String>,
}

impl RawHotspotActive {
    fn into_live(self) -> Option<LiveSession> {
        if self.user.is_empty() {
            return None;
        }
        Some(LiveSession {
            identity: self.user,
            peer_address: self.address,
            mac_address: self.mac_address.filter(|m| !m.is_empty()),
            kind: SessionKind::Hotspot,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawPppActive {
    #[serde(default)]
    name: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    address: String,
    #[serde(rename = "caller-id", default)]
    caller_id: Option<String>,
}

impl RawPppActive {
    fn into_live(self) -> Option<LiveSession> {
        if self.name.is_empty() {
            return None;
        }
        let kind = match self.service.as_str() {
            "pppoe" => SessionKind::Pppoe,
            _ => SessionKind::Unknown,
        };
        Some(LiveSession {
            identity: self.name,
            peer_address: self.address,
            mac_address: self.caller_id.filter(|m| !m.is_empty()),
            kind,
        })
    }
}

/// Parse RouterOS uptime strings: `1w2d3h4m5s`, `2d03:04:05`, or bare seconds.
pub fn parse_uptime(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut clock: Vec<u64> = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '0'..='9' => digits.push(c),
            ':' => {
                clock.push(digits.parse().ok()?);
                digits.clear();
            }
            'w' | 'd' | 'h' | 'm' | 's' => {
                let n: u64 = digits.parse().ok()?;
                digits.clear();
                let unit = match c {
                    'w' => 604_800,
                    'd' => 86_400,
                    'h' => 3_600,
                    'm' if chars.peek() == Some(&'s') => {
                        chars.next();
                        0
                    }
                    'm' => 60,
                    _ => 1,
                };
                total += n * unit;
            }
            _ => return None,
        }
    }

    if !clock.is_empty() {
        clock.push(digits.parse().ok()?);
        let [h, m, sec] = clock[..] else {
            return None;
        };
        total += h * 3_600 + m * 60 + sec;
    } else if !digits.is_empty() {
        total += digits.parse::<u64>().ok()?;
    }
    Some(total)
}
