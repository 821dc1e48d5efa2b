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

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{KEY_A, KEY_B, MockPlatform, device_of, lock_and_clear, nat_rules, reloads};
use fleetward_core::db::memory::MemoryStore;
use fleetward_core::fleet::{Fleet, FleetError, PUBLIC_KEY_PLACEHOLDER};
use fleetward_core::nat::PortAllocator;
use fleetward_core::peers::PeerStore;
use fleetward_core::peers::wgconf::derive_public_key;
use fleetward_types::callback::{HeartbeatRequest, PhoneHomeRequest};

struct Harness {
    store: Arc<MemoryStore>,
    fleet: Fleet<MemoryStore, MockPlatform>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = common::settings(dir.path());
    let store = Arc::new(MemoryStore::new());
    let peers = Arc::new(PeerStore::open(settings.tunnel.clone()).await.unwrap());
    let ports = Arc::new(PortAllocator::new(
        settings.console.public_address,
        settings.tunnel.hub_address(),
        settings.console.ports.clone(),
    ));
    let fleet = Fleet::new(Arc::clone(&store), peers, ports, settings).unwrap();
    Harness {
        store,
        fleet,
        _dir: dir,
    }
}

fn phone_home(key: &str, address: Option<&str>) -> PhoneHomeRequest {
    PhoneHomeRequest {
        public_key: key.into(),
        tunnel_address: address.map(Into::into),
    }
}

async fn settle(fleet: &Fleet<MemoryStore, MockPlatform>) {
    for _ in 0..200 {
        if fleet.pending_peer_applies() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer apply did not finish");
}

#[tokio::test]
async fn onboarding_allocates_and_is_repeatable() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let device = common::add_device(&h.store, "tower");

    let info = h.fleet.onboard(device.id).await.unwrap();
    assert_eq!(info.tunnel_address, Ipv4Addr::new(10, 99, 0, 2));
    assert_eq!(info.tunnel_prefix, 24);
    assert_eq!(info.console_port, 20000);
    assert_eq!(info.public_key, PUBLIC_KEY_PLACEHOLDER);
    assert_eq!(info.hub_public_key, derive_public_key(common::HUB_KEY).unwrap());
    assert_eq!(info.callback_token, "token-tower");
    assert_eq!(nat_rules().len(), 2);

    let again = h.fleet.onboard(device.id).await.unwrap();
    assert_eq!(again.tunnel_address, info.tunnel_address);
    assert_eq!(again.console_port, info.console_port);
    assert_eq!(nat_rules().len(), 2);
}

#[tokio::test]
async fn onboarding_issues_missing_token() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let device = common::add_device(&h.store, "tower");
    h.store.update_device(device.id, |d| d.callback_token = None);

    let info = h.fleet.onboard(device.id).await.unwrap();
    assert!(!info.callback_token.is_empty());
    assert_eq!(
        device_of(&h.store, device.id).callback_token.as_deref(),
        Some(info.callback_token.as_str())
    );
}

#[tokio::test]
async fn onboarding_unknown_device() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let err = h.fleet.onboard(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, FleetError::Alloc(_)));
}

#[tokio::test]
async fn phone_home_stores_key_and_applies_peer() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let device = common::add_device(&h.store, "tower");
    h.fleet.onboard(device.id).await.unwrap();

    let response = h
        .fleet
        .phone_home("token-tower", &phone_home(KEY_A, None))
        .await
        .unwrap();
    assert_eq!(response.address, "10.99.0.2/24");
    assert_eq!(response.allowed_ips, vec!["10.99.0.0/24".to_string()]);
    assert_eq!(response.hub_endpoint, "hub.example.net:51820");

    settle(&h.fleet).await;
    assert_eq!(device_of(&h.store, device.id).public_key.as_deref(), Some(KEY_A));
    let last = reloads().pop().unwrap();
    assert_eq!(last.peers.len(), 1);
    assert_eq!(last.peers[0].public_key, KEY_A);
    assert_eq!(last.peers[0].device_id, Some(device.id));
}

#[tokio::test]
async fn phone_home_rejects_bad_token_and_key() {
    let _guard = lock_and_clear();
    let h = harness().await;
    common::add_device(&h.store, "tower");

    let err = h
        .fleet
        .phone_home("wrong", &phone_home(KEY_A, None))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Unauthorized));

    let err = h
        .fleet
        .phone_home("token-tower", &phone_home("not-a-key", None))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidKey(_)));
}

#[tokio::test]
async fn negotiated_address_rules() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let allocated = common::add_device(&h.store, "allocated");
    h.fleet.onboard(allocated.id).await.unwrap();

    // differs from the allocation
    let err = h
        .fleet
        .phone_home("token-allocated", &phone_home(KEY_A, Some("10.99.0.9/24")))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::AddressRejected(_)));

    // matches it
    h.fleet
        .phone_home("token-allocated", &phone_home(KEY_A, Some("10.99.0.2")))
        .await
        .unwrap();

    let fresh = common::add_device(&h.store, "fresh");
    for bad in ["10.99.0.1", "10.99.0.2", "10.99.0.255", "192.168.1.5", "nonsense"] {
        let err = h
            .fleet
            .phone_home("token-fresh", &phone_home(KEY_B, Some(bad)))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AddressRejected(_)), "{bad} accepted");
    }

    let response = h
        .fleet
        .phone_home("token-fresh", &phone_home(KEY_B, Some("10.99.0.40/24")))
        .await
        .unwrap();
    assert_eq!(response.address, "10.99.0.40/24");
    assert_eq!(
        device_of(&h.store, fresh.id).tunnel_address,
        Some(Ipv4Addr::new(10, 99, 0, 40))
    );
    settle(&h.fleet).await;
}

#[tokio::test]
async fn decommission_tears_everything_down() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let device = common::add_device(&h.store, "tower");
    h.fleet.onboard(device.id).await.unwrap();
    h.fleet
        .phone_home("token-tower", &phone_home(KEY_A, None))
        .await
        .unwrap();
    settle(&h.fleet).await;

    h.fleet.decommission(device.id).await.unwrap();
    assert!(nat_rules().is_empty());
    assert!(h.fleet.peers().live_peers().await.is_empty());
    assert!(matches!(
        h.fleet.device_view(device.id).await,
        Err(FleetError::DeviceNotFound)
    ));
    assert!(matches!(
        h.fleet.decommission(device.id).await,
        Err(FleetError::DeviceNotFound)
    ));

    // the address is free again
    let next = common::add_device(&h.store, "next");
    let info = h.fleet.onboard(next.id).await.unwrap();
    assert_eq!(info.tunnel_address, Ipv4Addr::new(10, 99, 0, 2));
}

#[tokio::test]
async fn heartbeat_records_reported_address() {
    let _guard = lock_and_clear();
    let h = harness().await;
    let device = common::add_device(&h.store, "tower");

    let id = h
        .fleet
        .heartbeat(
            "token-tower",
            &HeartbeatRequest {
                public_address: Some("198.51.100.7".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(id, device.id);
    let device = device_of(&h.store, device.id);
    assert_eq!(device.reported_address.as_deref(), Some("198.51.100.7"));
    assert!(device.last_heartbeat.is_some());

    // never used for links
    let view = h.fleet.device_view(device.id).await.unwrap();
    assert!(view.links.is_none());
}
