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

pub mod memory;
pub mod pg;

use std::future::Future;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use fleetward_types::{
    ConsoleLinks, DeviceStatus, DeviceView, ResourceSnapshot, SessionKind, SessionStatus,
    SessionView, SubscriberView,
};
use ipnetwork::Ipv4Network;
use uuid::Uuid;

use crate::credentials::SealedSecret;
use crate::sessions::{AccountingRecord, ObservedSession, SessionKey};
use crate::status::StatusUpdate;

// ---------------------------------------------------------------------------
// Model types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub tunnel_address: Option<Ipv4Addr>,
    pub public_key: Option<String>,
    pub api_username: String,
    pub api_password: SealedSecret,
    pub api_port: u16,
    /// Console port on the device itself (the DNAT target).
    pub console_port: u16,
    /// Public port forwarded to `console_port`.
    pub public_port: Option<u16>,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub resources: Option<ResourceSnapshot>,
    pub last_error: Option<String>,
    pub callback_token: Option<String>,
    pub reported_address: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn view(&self) -> DeviceView {
        DeviceView {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            last_seen: self.last_seen,
            cpu: self.resources.map(|r| r.cpu_percent),
            memory: self.resources.map(|r| r.memory_percent),
            uptime: self.resources.map(|r| r.uptime_secs),
            tunnel_address: self.tunnel_address,
            console_port: self.public_port,
            last_error: self.last_error.clone(),
            links: self
                .tunnel_address
                .map(|ip| ConsoleLinks::for_tunnel(ip, self.console_port, self.api_port)),
        }
    }
}

/// Fields the administrative layer supplies when it creates a router.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub name: String,
    pub api_username: String,
    pub api_password: SealedSecret,
    pub api_port: u16,
    pub console_port: u16,
    pub callback_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: Uuid,
    pub device_id: Uuid,
    pub identity: String,
    pub peer_address: String,
    pub mac_address: Option<String>,
    pub kind: SessionKind,
    pub accounting_id: Option<String>,
    pub status: SessionStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            device_id: self.device_id,
            identity: self.identity.clone(),
            peer_address: self.peer_address.clone(),
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            device_id: self.device_id,
            identity: self.identity.clone(),
            peer_address: self.peer_address.clone(),
            mac_address: self.mac_address.clone(),
            kind: self.kind,
            status: self.status,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Result of a transactional scan-and-reserve for a tunnel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClaim {
    Claimed(Ipv4Addr),
    Existing(Ipv4Addr),
    Exhausted,
    NotFound,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Device records. Rows are created by the administrative layer; the engine
/// writes addressing, key, port and probe fields.
pub trait DeviceStore: Send + Sync {
    /// All devices that are not soft-deleted, oldest first.
    fn list_devices(&self) -> impl Future<Output = Result<Vec<Device>>> + Send;

    fn get_device(&self, id: Uuid) -> impl Future<Output = Result<Option<Device>>> + Send;

    fn get_device_by_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<Device>>> + Send;

    /// Atomically pick the lowest free host in `subnet` and persist it on the
    /// device. Must be serialized against every other claim.
    fn claim_lowest_address(
        &self,
        id: Uuid,
        subnet: Ipv4Network,
    ) -> impl Future<Output = Result<AddressClaim>> + Send;

    /// Atomically claim a specific address. False when it belongs to another
    /// device or the device already holds a different one.
    fn claim_address(
        &self,
        id: Uuid,
        address: Ipv4Addr,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn set_public_key(&self, id: Uuid, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn set_callback_token(
        &self,
        id: Uuid,
        token: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_last_error(
        &self,
        id: Uuid,
        error: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn record_status(
        &self,
        id: Uuid,
        update: &StatusUpdate,
    ) -> impl Future<Output = Result<()>> + Send;

    fn record_heartbeat(
        &self,
        id: Uuid,
        reported_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn used_public_ports(&self) -> impl Future<Output = Result<Vec<u16>>> + Send;

    /// Persist `port` on the device. False when another device holds it or
    /// the device already has a port.
    fn assign_public_port(
        &self,
        id: Uuid,
        port: u16,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn clear_public_port(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send;

    /// Mark the device deleted. False if it was already gone.
    fn soft_delete(&self, id: Uuid) -> impl Future<Output = Result<bool>> + Send;
}

/// Canonical session rows and the subscriber flags projected from them.
pub trait SessionStore: Send + Sync {
    fn active_sessions(&self) -> impl Future<Output = Result<Vec<SessionRow>>> + Send;

    /// Insert or refresh one active row per key. Disconnected rows are never
    /// revived; a key without an active row gets a fresh row.
    fn upsert_active(
        &self,
        sessions: &[ObservedSession],
        seen_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn disconnect(
        &self,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Recompute `online` for the named subscribers. Unknown identities are
    /// skipped. Returns how many subscriber rows were matched.
    fn refresh_subscriber_flags(
        &self,
        identities: &[String],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn force_all_offline(&self) -> impl Future<Output = Result<usize>> + Send;

    fn count_active(&self) -> impl Future<Output = Result<i64>> + Send;

    fn record_orphans(
        &self,
        records: &[AccountingRecord],
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn subscriber(
        &self,
        identity: &str,
    ) -> impl Future<Output = Result<Option<SubscriberView>>> + Send;
}

/// Secondary session source: an accounting ledger keyed by start/stop times.
pub trait AccountingLedger: Send + Sync {
    /// Records without a stop time updated at or after `since`.
    fn open_records(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<AccountingRecord>>> + Send;
}

pub trait FleetStore: DeviceStore + SessionStore + AccountingLedger + 'static {}

impl<T> FleetStore for T where T: DeviceStore + SessionStore + AccountingLedger + 'static {}
