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

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use fleetward_core::alloc::{AllocError, allocate_address};
use fleetward_core::db::DeviceStore;
use fleetward_core::db::memory::MemoryStore;
use ipnetwork::Ipv4Network;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_never_collide() {
    let store = Arc::new(MemoryStore::new());
    let subnet: Ipv4Network = "10.99.0.0/24".parse().unwrap();
    let ids: Vec<_> = (0..32)
        .map(|i| common::add_device(&store, &format!("r{i}")).id)
        .collect();

    let mut handles = Vec::new();
    for id in ids.clone() {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            allocate_address(store.as_ref(), id, subnet).await
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let address = handle.await.unwrap().unwrap();
        assert!(subnet.contains(address));
        assert_ne!(address, Ipv4Addr::new(10, 99, 0, 1), "hub address handed out");
        assert!(seen.insert(address), "duplicate address {address}");
    }
    assert_eq!(seen.len(), 32);

    // lowest-first: exactly .2 through .33
    let expected: HashSet<_> = (2..34).map(|o| Ipv4Addr::new(10, 99, 0, o)).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn allocation_is_idempotent() {
    let store = MemoryStore::new();
    let subnet: Ipv4Network = "10.99.0.0/24".parse().unwrap();
    let device = common::add_device(&store, "r1");

    let first = allocate_address(&store, device.id, subnet).await.unwrap();
    let second = allocate_address(&store, device.id, subnet).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        store.get_device(device.id).await.unwrap().unwrap().tunnel_address,
        Some(first)
    );
}

#[tokio::test]
async fn exhausted_subnet_assigns_nothing() {
    let store = MemoryStore::new();
    // .2 through .6 are usable
    let subnet: Ipv4Network = "10.99.0.0/29".parse().unwrap();
    for i in 0..5 {
        let device = common::add_device(&store, &format!("r{i}"));
        allocate_address(&store, device.id, subnet).await.unwrap();
    }

    let late = common::add_device(&store, "late");
    let err = allocate_address(&store, late.id, subnet).await.unwrap_err();
    assert!(matches!(err, AllocError::SubnetExhausted(net) if net == subnet));
    assert_eq!(store.get_device(late.id).await.unwrap().unwrap().tunnel_address, None);
}

#[tokio::test]
async fn freed_address_is_reused_lowest_first() {
    let store = MemoryStore::new();
    let subnet: Ipv4Network = "10.99.0.0/24".parse().unwrap();
    let a = common::add_device(&store, "a");
    let b = common::add_device(&store, "b");
    allocate_address(&store, a.id, subnet).await.unwrap();
    allocate_address(&store, b.id, subnet).await.unwrap();

    store.soft_delete(a.id).await.unwrap();
    let c = common::add_device(&store, "c");
    assert_eq!(
        allocate_address(&store, c.id, subnet).await.unwrap(),
        Ipv4Addr::new(10, 99, 0, 2)
    );
}

#[tokio::test]
async fn unknown_device_is_rejected() {
    let store = MemoryStore::new();
    let subnet: Ipv4Network = "10.99.0.0/24".parse().unwrap();
    let err = allocate_address(&store, uuid::Uuid::new_v4(), subnet)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocError::DeviceNotFound));
}
