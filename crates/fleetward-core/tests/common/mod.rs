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

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetward_core::config::{FleetSettings, FleetToml};
use fleetward_core::credentials::CredentialCipher;
use fleetward_core::db::memory::MemoryStore;
use fleetward_core::db::{Device, NewDevice};
use fleetward_core::nat::NatRule;
use fleetward_core::peers::wgconf::WgConfig;
use fleetward_core::platform::{Platform, PlatformError};
use fleetward_core::probe::{Management, ProbeError, ProbeTarget};
use fleetward_core::sessions::LiveSession;
use fleetward_types::{ResourceSnapshot, SessionKind};

pub const HUB_KEY: &str = "YNqHbfBQKaGvzefSSTjYl8Q0Ne1Hs+PRpVxJrzmYMFk=";
pub const KEY_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
pub const KEY_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";
pub const KEY_C: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

// Global statics require serial execution for platform tests.

pub static TEST_LOCK: Mutex<()> = Mutex::new(());
static RELOADS: Mutex<Vec<WgConfig>> = Mutex::new(Vec::new());
static NAT_RULES: Mutex<Vec<NatRule>> = Mutex::new(Vec::new());
static NAT_INSERTS: Mutex<Vec<NatRule>> = Mutex::new(Vec::new());
static FAIL_RELOAD: AtomicBool = AtomicBool::new(false);
static FAIL_SNAT_INSERT: AtomicBool = AtomicBool::new(false);
static FAIL_DNAT_DELETE: AtomicBool = AtomicBool::new(false);

pub struct MockPlatform;

impl Platform for MockPlatform {
    async fn reload_interface(_name: &str, config: &WgConfig) -> Result<(), PlatformError> {
        if FAIL_RELOAD.load(Ordering::SeqCst) {
            return Err(PlatformError::Interface("mock reload failure".into()));
        }
        RELOADS.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn interface_exists(_name: &str) -> Result<bool, PlatformError> {
        Ok(true)
    }

    async fn nat_rule_present(rule: &NatRule) -> Result<bool, PlatformError> {
        Ok(NAT_RULES.lock().unwrap().contains(rule))
    }

    async fn insert_nat_rule(rule: &NatRule) -> Result<(), PlatformError> {
        if matches!(rule, NatRule::Snat { .. }) && FAIL_SNAT_INSERT.load(Ordering::SeqCst) {
            return Err(PlatformError::Firewall("mock snat failure".into()));
        }
        NAT_INSERTS.lock().unwrap().push(rule.clone());
        NAT_RULES.lock().unwrap().push(rule.clone());
        Ok(())
    }

    async fn delete_nat_rule(rule: &NatRule) -> Result<(), PlatformError> {
        if matches!(rule, NatRule::Dnat { .. }) && FAIL_DNAT_DELETE.load(Ordering::SeqCst) {
            return Err(PlatformError::Firewall("mock dnat delete failure".into()));
        }
        let mut rules = NAT_RULES.lock().unwrap();
        match rules.iter().position(|r| r == rule) {
            Some(idx) => {
                rules.remove(idx);
                Ok(())
            }
            None => Err(PlatformError::Firewall("no such rule".into())),
        }
    }
}

/// Acquire the test lock and clear mock state. Hold the returned guard for
/// the duration of the test.
pub fn lock_and_clear() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    RELOADS.lock().unwrap().clear();
    NAT_RULES.lock().unwrap().clear();
    NAT_INSERTS.lock().unwrap().clear();
    FAIL_RELOAD.store(false, Ordering::SeqCst);
    FAIL_SNAT_INSERT.store(false, Ordering::SeqCst);
    FAIL_DNAT_DELETE.store(false, Ordering::SeqCst);
    guard
}

pub fn reloads() -> Vec<WgConfig> {
    RELOADS.lock().unwrap().clone()
}

pub fn nat_rules() -> Vec<NatRule> {
    NAT_RULES.lock().unwrap().clone()
}

pub fn nat_inserts() -> Vec<NatRule> {
    NAT_INSERTS.lock().unwrap().clone()
}

pub fn drop_nat_rule(rule: &NatRule) {
    NAT_RULES.lock().unwrap().retain(|r| r != rule);
}

pub fn fail_reload(fail: bool) {
    FAIL_RELOAD.store(fail, Ordering::SeqCst);
}

pub fn fail_snat_insert(fail: bool) {
    FAIL_SNAT_INSERT.store(fail, Ordering::SeqCst);
}

pub fn fail_dnat_delete(fail: bool) {
    FAIL_DNAT_DELETE.store(fail, Ordering::SeqCst);
}

// -- Fixtures --

pub fn settings(dir: &Path) -> FleetSettings {
    let mut toml = FleetToml::default();
    toml.tunnel.subnet = "10.99.0.0/24".into();
    toml.tunnel.private_key = HUB_KEY.into();
    toml.tunnel.config_path = dir.join("wg0.conf").display().to_string();
    toml.tunnel.endpoint = "hub.example.net:51820".into();
    toml.console.public_address = "203.0.113.10".into();
    toml.console.port_range_start = 20000;
    toml.console.port_range_end = 20009;
    toml.schedule.peer_resync_every = 0;
    toml.validate().unwrap()
}

pub fn cipher() -> CredentialCipher {
    CredentialCipher::new([9u8; 32])
}

pub fn add_device(store: &MemoryStore, name: &str) -> Device {
    store.insert_device(NewDevice {
        name: name.into(),
        api_username: "admin".into(),
        api_password: cipher().seal("router-pass").unwrap(),
        api_port: 8728,
        console_port: 80,
        callback_token: Some(format!("token-{name}")),
    })
}

/// A device that already has an address and a key, as after phone-home.
pub fn add_addressed_device(store: &MemoryStore, name: &str, octet: u8, key: Option<&str>) -> Device {
    let device = add_device(store, name);
    store.update_device(device.id, |d| {
        d.tunnel_address = Some(Ipv4Addr::new(10, 99, 0, octet));
        d.public_key = key.map(str::to_string);
    });
    device_of(store, device.id)
}

pub fn device_of(store: &MemoryStore, id: uuid::Uuid) -> Device {
    futures::executor::block_on(fleetward_core::db::DeviceStore::get_device(store, id))
        .unwrap()
        .unwrap()
}

pub fn snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent: 4.0,
        memory_percent: 30.0,
        uptime_secs: 7200,
    }
}

pub fn live(identity: &str, ip: &str) -> LiveSession {
    LiveSession {
        identity: identity.into(),
        peer_address: ip.into(),
        mac_address: Some("AA:BB:CC:DD:EE:FF".into()),
        kind: SessionKind::Hotspot,
    }
}

// -- Management mock --

#[derive(Debug, Clone)]
pub enum Behaviour {
    Alive(ResourceSnapshot, Vec<LiveSession>),
    Fail,
    Hang,
}

/// Per tunnel address responses; unknown addresses fail.
#[derive(Default)]
pub struct MockManagement {
    behaviour: Mutex<HashMap<Ipv4Addr, Behaviour>>,
}

impl MockManagement {
    pub fn set(&self, address: Ipv4Addr, behaviour: Behaviour) {
        self.behaviour.lock().unwrap().insert(address, behaviour);
    }

    fn get(&self, address: Ipv4Addr) -> Behaviour {
        self.behaviour
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or(Behaviour::Fail)
    }
}

impl Management for MockManagement {
    async fn resources(&self, target: &ProbeTarget) -> Result<ResourceSnapshot, ProbeError> {
        match self.get(target.address) {
            Behaviour::Alive(snapshot, _) => Ok(snapshot),
            Behaviour::Fail => Err(ProbeError::Status {
                status: 503,
                body: "unavailable".into(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProbeError::Timeout(Duration::from_secs(3600)))
            }
        }
    }

    async fn active_sessions(&self, target: &ProbeTarget) -> Result<Vec<LiveSession>, ProbeError> {
        match self.get(target.address) {
            Behaviour::Alive(_, sessions) => Ok(sessions),
            Behaviour::Fail => Err(ProbeError::Status {
                status: 503,
                body: "unavailable".into(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProbeError::Timeout(Duration::from_secs(3600)))
            }
        }
    }
}
