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

//! In-process store with the same semantics as the Postgres one. Every
//! operation runs under one lock, which gives the scan-and-reserve methods
//! their atomicity.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use fleetward_types::{DeviceStatus, SessionStatus, SubscriberView};
use ipnetwork::Ipv4Network;
use uuid::Uuid;

use super::{
    AccountingLedger, AddressClaim, Device, DeviceStore, NewDevice, Result, SessionRow,
    SessionStore,
};
use crate::alloc::lowest_free_host;
use crate::sessions::{AccountingRecord, ObservedSession};
use crate::status::StatusUpdate;

#[derive(Default)]
struct Inner {
    devices: Vec<(Device, bool)>,
    sessions: Vec<SessionRow>,
    subscribers: BTreeMap<String, bool>,
    accounting: Vec<AccountingRecord>,
    orphans: Vec<(AccountingRecord, DateTime<Utc>)>,
}

impl Inner {
    fn live(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|(_, deleted)| !deleted).map(|(d, _)| d)
    }

    fn live_mut(&mut self, id: Uuid) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|(d, deleted)| !deleted && d.id == id)
            .map(|(d, _)| d)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_device(&self, new: NewDevice) -> Device {
        let device = Device {
            id: Uuid::new_v4(),
            name: new.name,
            tunnel_address: None,
            public_key: None,
            api_username: new.api_username,
            api_password: new.api_password,
            api_port: new.api_port,
            console_port: new.console_port,
            public_port: None,
            status: DeviceStatus::Pending,
            last_seen: None,
            resources: None,
            last_error: None,
            callback_token: new.callback_token,
            reported_address: None,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        self.lock().devices.push((device.clone(), false));
        device
    }

    /// Overwrite fields directly, bypassing the engine.
    pub fn update_device(&self, id: Uuid, f: impl FnOnce(&mut Device)) -> bool {
        match self.lock().live_mut(id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }

    pub fn add_subscriber(&self, identity: &str) {
        self.lock().subscribers.insert(identity.to_string(), false);
    }

    pub fn subscriber_online(&self, identity: &str) -> Option<bool> {
        self.lock().subscribers.get(identity).copied()
    }

    pub fn push_accounting(&self, record: AccountingRecord) {
        self.lock().accounting.push(record);
    }

    /// Close an accounting row, as a stop record would.
    pub fn stop_accounting(&self, session_id: &str) {
        self.lock().accounting.retain(|r| r.session_id != session_id);
    }

    /// Every session row ever written, active or not.
    pub fn sessions(&self) -> Vec<SessionRow> {
        self.lock().sessions.clone()
    }

    pub fn orphans(&self) -> Vec<AccountingRecord> {
        self.lock().orphans.iter().map(|(r, _)| r.clone()).collect()
    }
}

impl DeviceStore for MemoryStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.lock().live().cloned().collect())
    }

    async fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.lock().live().find(|d| d.id == id).cloned())
    }

    async fn get_device_by_token(&self, token: &str) -> Result<Option<Device>> {
        Ok(self
            .lock()
            .live()
            .find(|d| d.callback_token.as_deref() == Some(token))
            .cloned())
    }

    async fn claim_lowest_address(&self, id: Uuid, subnet: Ipv4Network) -> Result<AddressClaim> {
        let mut inner = self.lock();
        let Some(device) = inner.live().find(|d| d.id == id) else {
            return Ok(AddressClaim::NotFound);
        };
        if let Some(existing) = device.tunnel_address {
            return Ok(AddressClaim::Existing(existing));
        }
        let used: Vec<Ipv4Addr> = inner.live().filter_map(|d| d.tunnel_address).collect();
        let Some(address) = lowest_free_host(subnet, used) else {
            return Ok(AddressClaim::Exhausted);
        };
        if let Some(device) = inner.live_mut(id) {
            device.tunnel_address = Some(address);
        }
        Ok(AddressClaim::Claimed(address))
    }

    async fn claim_address(&self, id: Uuid, address: Ipv4Addr) -> Result<bool> {
        let mut inner = self.lock();
        let Some(device) = inner.live().find(|d| d.id == id) else {
            return Ok(false);
        };
        if let Some(existing) = device.tunnel_address {
            return Ok(existing == address);
        }
        if inner.live().any(|d| d.tunnel_address == Some(address)) {
            return Ok(false);
        }
        if let Some(device) = inner.live_mut(id) {
            device.tunnel_address = Some(address);
        }
        Ok(true)
    }

    async fn set_public_key(&self, id: Uuid, key: &str) -> Result<()> {
        let mut inner = self.lock();
        for (device, deleted) in inner.devices.iter_mut() {
            if !*deleted && device.id != id && device.public_key.as_deref() == Some(key) {
                device.public_key = None;
            }
        }
        if let Some(device) = inner.live_mut(id) {
            device.public_key = Some(key.to_string());
        }
        Ok(())
    }

    async fn set_callback_token(&self, id: Uuid, token: &str) -> Result<()> {
        if let Some(device) = self.lock().live_mut(id) {
            device.callback_token = Some(token.to_string());
        }
        Ok(())
    }

    async fn set_last_error(&self, id: Uuid, error: Option<&str>) -> Result<()> {
        if let Some(device) = self.lock().live_mut(id) {
            device.last_error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_status(&self, id: Uuid, update: &StatusUpdate) -> Result<()> {
        if let Some(device) = self.lock().live_mut(id) {
            device.status = update.status;
            device.last_seen = update.last_seen;
            device.resources = update.resources;
            device.last_error = update.last_error.clone();
        }
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        reported_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(device) = self.lock().live_mut(id) {
            device.reported_address = reported_address.map(str::to_string);
            device.last_heartbeat = Some(at);
        }
        Ok(())
    }

    async fn used_public_ports(&self) -> Result<Vec<u16>> {
        Ok(self.lock().live().filter_map(|d| d.public_port).collect())
    }

    async fn assign_public_port(&self, id: Uuid, port: u16) -> Result<bool> {
        let mut inner = self.lock();
        let Some(device) = inner.live().find(|d| d.id == id) else {
            return Ok(false);
        };
        if let Some(existing) = device.public_port {
            return Ok(existing == port);
        }
        if inner.live().any(|d| d.public_port == Some(port)) {
            return Ok(false);
        }
        if let Some(device) = inner.live_mut(id) {
            device.public_port = Some(port);
        }
        Ok(true)
    }

    async fn clear_public_port(&self, id: Uuid) -> Result<()> {
        if let Some(device) = self.lock().live_mut(id) {
            device.public_port = None;
        }
        Ok(())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner.devices.iter_mut().find(|(d, deleted)| !*deleted && d.id == id) {
            Some((_, deleted)) => {
                *deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl SessionStore for MemoryStore {
    async fn active_sessions(&self) -> Result<Vec<SessionRow>> {
        Ok(self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn upsert_active(&self, sessions: &[ObservedSession], seen_at: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock();
        for observed in sessions {
            let existing = inner
                .sessions
                .iter_mut()
                .find(|row| row.status == SessionStatus::Active && row.key() == observed.key);
            match existing {
                Some(row) => {
                    row.last_seen = seen_at;
                    row.kind = observed.kind;
                    if observed.mac_address.is_some() {
                        row.mac_address = observed.mac_address.clone();
                    }
                    if observed.accounting_id.is_some() {
                        row.accounting_id = observed.accounting_id.clone();
                    }
                }
                None => inner.sessions.push(SessionRow {
                    id: Uuid::new_v4(),
                    device_id: observed.key.device_id,
                    identity: observed.key.identity.clone(),
                    peer_address: observed.key.peer_address.clone(),
                    mac_address: observed.mac_address.clone(),
                    kind: observed.kind,
                    accounting_id: observed.accounting_id.clone(),
                    status: SessionStatus::Active,
                    first_seen: seen_at,
                    last_seen: seen_at,
                    ended_at: None,
                }),
            }
        }
        Ok(sessions.len())
    }

    async fn disconnect(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut count = 0;
        for row in self.lock().sessions.iter_mut() {
            if row.status == SessionStatus::Active && ids.contains(&row.id) {
                row.status = SessionStatus::Disconnected;
                row.ended_at = Some(at);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn refresh_subscriber_flags(&self, identities: &[String]) -> Result<usize> {
        let mut inner = self.lock();
        let online: HashSet<String> = inner
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .map(|s| s.identity.clone())
            .collect();
        let mut matched = 0;
        for identity in identities {
            if let Some(flag) = inner.subscribers.get_mut(identity) {
                *flag = online.contains(identity);
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn force_all_offline(&self) -> Result<usize> {
        let mut forced = 0;
        for flag in self.lock().subscribers.values_mut() {
            if *flag {
                *flag = false;
                forced += 1;
            }
        }
        Ok(forced)
    }

    async fn count_active(&self) -> Result<i64> {
        let count = self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count();
        Ok(count as i64)
    }

    async fn record_orphans(&self, records: &[AccountingRecord], at: DateTime<Utc>) -> Result<()> {
        self.lock()
            .orphans
            .extend(records.iter().cloned().map(|r| (r, at)));
        Ok(())
    }

    async fn subscriber(&self, identity: &str) -> Result<Option<SubscriberView>> {
        let inner = self.lock();
        let Some(online) = inner.subscribers.get(identity).copied() else {
            return Ok(None);
        };
        let sessions = inner
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active && s.identity == identity)
            .map(SessionRow::view)
            .collect();
        Ok(Some(SubscriberView {
            identity: identity.to_string(),
            online,
            sessions,
        }))
    }
}

impl AccountingLedger for MemoryStore {
    async fn open_records(&self, since: DateTime<Utc>) -> Result<Vec<AccountingRecord>> {
        Ok(self
            .lock()
            .accounting
            .iter()
            .filter(|r| r.updated_at >= since)
            .cloned()
            .collect())
    }
}
