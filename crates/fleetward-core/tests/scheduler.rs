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

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::{Behaviour, MockManagement, MockPlatform, device_of, live, snapshot};
use fleetward_core::config::{FleetSettings, ScheduleSettings};
use fleetward_core::credentials::CredentialCipher;
use fleetward_core::db::memory::MemoryStore;
use fleetward_core::peers::PeerStore;
use fleetward_core::scheduler::FleetScheduler;
use fleetward_core::sessions::{ReconcileSettings, SessionReconciler};
use fleetward_types::DeviceStatus;

type Scheduler = FleetScheduler<MemoryStore, MockManagement, MockPlatform>;

struct Harness {
    store: Arc<MemoryStore>,
    management: Arc<MockManagement>,
    _dir: tempfile::TempDir,
    settings: FleetSettings,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = common::settings(dir.path());
    settings.schedule.probe_timeout = Duration::from_millis(200);
    settings.schedule.cycle_deadline = Duration::from_secs(5);
    Harness {
        store: Arc::new(MemoryStore::new()),
        management: Arc::new(MockManagement::default()),
        _dir: dir,
        settings,
    }
}

impl Harness {
    async fn scheduler(&self, schedule: ScheduleSettings) -> Scheduler {
        let peers = Arc::new(PeerStore::open(self.settings.tunnel.clone()).await.unwrap());
        let reconciler = SessionReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.management),
            common::cipher(),
            ReconcileSettings {
                accounting_window: self.settings.sessions.accounting_window,
                idle_timeout: self.settings.sessions.idle_timeout,
                enumerate_timeout: schedule.probe_timeout,
                max_workers: schedule.max_workers,
            },
        );
        FleetScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.management),
            peers,
            reconciler,
            common::cipher(),
            schedule,
        )
    }
}

#[tokio::test]
async fn cycle_probes_addressed_devices() {
    let h = harness();
    let up = common::add_addressed_device(&h.store, "up", 2, None);
    let down = common::add_addressed_device(&h.store, "down", 3, None);
    let unaddressed = common::add_device(&h.store, "new");
    h.management.set(
        up.tunnel_address.unwrap(),
        Behaviour::Alive(snapshot(), vec![live("alice", "10.5.50.2")]),
    );

    let scheduler = h.scheduler(h.settings.schedule.clone()).await;
    let summary = scheduler.run_cycle().await.unwrap();

    assert_eq!(summary.probed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.online, 1);
    assert_eq!(summary.active_sessions, 1);
    assert!(summary.finished_at >= summary.started_at);

    let up = device_of(&h.store, up.id);
    assert_eq!(up.status, DeviceStatus::Online);
    assert_eq!(up.resources, Some(snapshot()));
    assert!(up.last_seen.is_some());

    // never seen: stays pending with the error recorded
    let down = device_of(&h.store, down.id);
    assert_eq!(down.status, DeviceStatus::Pending);
    assert!(down.last_error.is_some());

    assert_eq!(device_of(&h.store, unaddressed.id).status, DeviceStatus::Pending);
    assert_eq!(scheduler.latest_summary().probed, 2);
}

#[tokio::test]
async fn failure_marks_offline_only_once_stale() {
    let h = harness();
    let recent = common::add_addressed_device(&h.store, "recent", 2, None);
    let stale = common::add_addressed_device(&h.store, "stale", 3, None);
    let now = Utc::now();
    h.store.update_device(recent.id, |d| {
        d.status = DeviceStatus::Online;
        d.last_seen = Some(now - TimeDelta::seconds(60));
    });
    h.store.update_device(stale.id, |d| {
        d.status = DeviceStatus::Online;
        d.last_seen = Some(now - TimeDelta::seconds(600));
        d.resources = Some(snapshot());
    });

    let scheduler = h.scheduler(h.settings.schedule.clone()).await;
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.online, 1);
    assert_eq!(summary.offline, 1);

    assert_eq!(device_of(&h.store, recent.id).status, DeviceStatus::Online);
    let stale = device_of(&h.store, stale.id);
    assert_eq!(stale.status, DeviceStatus::Offline);
    // last good reading is kept
    assert_eq!(stale.resources, Some(snapshot()));
}

#[tokio::test]
async fn probe_timeout_counts_as_failure() {
    let h = harness();
    let device = common::add_addressed_device(&h.store, "slow", 2, None);
    h.store.update_device(device.id, |d| d.status = DeviceStatus::Online);
    h.management.set(device.tunnel_address.unwrap(), Behaviour::Hang);

    let scheduler = h.scheduler(h.settings.schedule.clone()).await;
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.failed, 1);
    let device = device_of(&h.store, device.id);
    assert!(device.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn cycle_deadline_abandons_probes() {
    let h = harness();
    let device = common::add_addressed_device(&h.store, "slow", 2, None);
    h.management.set(device.tunnel_address.unwrap(), Behaviour::Hang);

    let mut schedule = h.settings.schedule.clone();
    schedule.probe_timeout = Duration::from_secs(30);
    schedule.cycle_deadline = Duration::from_millis(150);
    let scheduler = h.scheduler(schedule).await;

    let started = std::time::Instant::now();
    let summary = scheduler.run_cycle().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.failed, 1);
    assert_eq!(
        device_of(&h.store, device.id).last_error.as_deref(),
        Some("cycle deadline exceeded")
    );
}

#[tokio::test]
async fn undecryptable_credentials_are_fatal() {
    let h = harness();
    let device = common::add_addressed_device(&h.store, "locked", 2, None);
    let foreign = CredentialCipher::new([1u8; 32]).seal("router-pass").unwrap();
    h.store.update_device(device.id, |d| {
        d.status = DeviceStatus::Online;
        d.last_seen = Some(Utc::now());
        d.api_password = foreign;
    });
    h.management.set(
        device.tunnel_address.unwrap(),
        Behaviour::Alive(snapshot(), vec![]),
    );

    let scheduler = h.scheduler(h.settings.schedule.clone()).await;
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(device_of(&h.store, device.id).status, DeviceStatus::Offline);
}

#[tokio::test]
async fn worker_cap_still_probes_everything() {
    let h = harness();
    let mut ids = Vec::new();
    for octet in 2..12u8 {
        let device = common::add_addressed_device(&h.store, &format!("r{octet}"), octet, None);
        h.management.set(
            device.tunnel_address.unwrap(),
            Behaviour::Alive(snapshot(), vec![]),
        );
        ids.push(device.id);
    }

    let mut schedule = h.settings.schedule.clone();
    schedule.max_workers = 2;
    let scheduler = h.scheduler(schedule).await;
    let summary = scheduler.run_cycle().await.unwrap();
    assert_eq!(summary.probed, 10);
    assert_eq!(summary.online, 10);
    for id in ids {
        assert_eq!(device_of(&h.store, id).status, DeviceStatus::Online);
    }
}

#[tokio::test]
async fn peer_resync_runs_on_schedule() {
    let _guard = common::lock_and_clear();
    let h = harness();
    common::add_addressed_device(&h.store, "a", 2, Some(common::KEY_A));

    let mut schedule = h.settings.schedule.clone();
    schedule.peer_resync_every = 2;
    let scheduler = h.scheduler(schedule).await;

    scheduler.run_cycle().await.unwrap();
    assert!(common::reloads().is_empty());
    scheduler.run_cycle().await.unwrap();
    assert_eq!(common::reloads().len(), 1);
    assert_eq!(common::reloads()[0].peers.len(), 1);
}
