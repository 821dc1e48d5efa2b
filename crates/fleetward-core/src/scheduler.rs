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

//! Periodic fleet sweep: probe every addressed device, write the status
//! transitions, then reconcile sessions against the fresh online set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use fleetward_types::{DeviceError, DeviceStatus, FleetSummary};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ScheduleSettings;
use crate::credentials::CredentialCipher;
use crate::db::{Device, FleetStore, StoreError};
use crate::peers::PeerStore;
use crate::platform::Platform;
use crate::probe::{Management, ProbeError, ProbeTarget};
use crate::sessions::SessionReconciler;
use crate::status::{ProbeOutcome, transition};

const DEADLINE_EXCEEDED: &str = "cycle deadline exceeded";

pub struct FleetScheduler<S, M, P> {
    store: Arc<S>,
    management: Arc<M>,
    peers: Arc<PeerStore<P>>,
    reconciler: SessionReconciler<S, M>,
    cipher: CredentialCipher,
    settings: ScheduleSettings,
    cycles: AtomicU64,
    latest: RwLock<FleetSummary>,
}

impl<S, M, P> FleetScheduler<S, M, P>
where
    S: FleetStore,
    M: Management,
    P: Platform,
{
    pub fn new(
        store: Arc<S>,
        management: Arc<M>,
        peers: Arc<PeerStore<P>>,
        reconciler: SessionReconciler<S, M>,
        cipher: CredentialCipher,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            store,
            management,
            peers,
            reconciler,
            cipher,
            settings,
            cycles: AtomicU64::new(0),
            latest: RwLock::new(FleetSummary::default()),
        }
    }

    /// Summary of the last finished cycle.
    pub fn latest_summary(&self) -> FleetSummary {
        self.latest
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Sweep forever on the configured interval. A cycle that overruns the
    /// interval skips the missed ticks.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.settings.interval.as_secs(), "fleet scheduler started");

        loop {
            interval.tick().await;
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "fleet cycle aborted, will retry next tick");
            }
        }
    }

    #[tracing::instrument(skip(self), fields(cycle = tracing::field::Empty))]
    pub async fn run_cycle(&self) -> Result<FleetSummary, StoreError> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::Span::current().record("cycle", cycle);

        let started = Utc::now();
        let mut summary = FleetSummary {
            started_at: Some(started),
            ..Default::default()
        };

        let mut devices = self.store.list_devices().await?;
        debug!(device_count = devices.len(), "starting fleet cycle");

        let outcomes = self.probe_all(&devices, &mut summary).await;

        let now = Utc::now();
        for device in devices.iter_mut() {
            let Some(outcome) = outcomes.get(&device.id) else {
                continue;
            };
            let update = transition(device, outcome, now, self.settings.staleness);
            if let Err(e) = self.store.record_status(device.id, &update).await {
                error!(device_id = %device.id, error = %e, "failed to record device status");
                summary.errors.push(DeviceError {
                    device_id: device.id,
                    error: e.to_string(),
                });
                continue;
            }
            if update.status != device.status {
                info!(
                    device_id = %device.id,
                    from = %device.status,
                    to = %update.status,
                    "device status changed"
                );
            }
            if let Some(e) = outcome.error() {
                summary.failed += 1;
                summary.errors.push(DeviceError {
                    device_id: device.id,
                    error: e.to_string(),
                });
            }
            device.status = update.status;
            device.last_seen = update.last_seen;
            device.resources = update.resources;
            device.last_error = update.last_error;
        }
        summary.online = devices.iter().filter(|d| d.status == DeviceStatus::Online).count();
        summary.offline = devices.iter().filter(|d| d.status == DeviceStatus::Offline).count();

        match self.reconciler.reconcile(&devices, now).await {
            Ok(report) => {
                summary.active_sessions = report.active_sessions;
                summary.orphaned_accounting = report.orphaned_accounting;
                summary.errors.extend(report.errors);
            }
            Err(e) => error!(error = %e, "session reconciliation failed"),
        }

        let every = u64::from(self.settings.peer_resync_every);
        if every > 0 && cycle % every == 0 {
            match self.peers.reconcile_all(self.store.as_ref()).await {
                Ok(report) if report.failed > 0 => {
                    warn!(failed = report.failed, errors = ?report.errors, "peer resync incomplete")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "peer resync failed"),
            }
        }

        summary.finished_at = Some(Utc::now());
        info!(
            probed = summary.probed,
            online = summary.online,
            offline = summary.offline,
            skipped = summary.skipped,
            failed = summary.failed,
            active_sessions = summary.active_sessions,
            orphans = summary.orphaned_accounting,
            "fleet cycle complete"
        );

        match self.latest.write() {
            Ok(mut latest) => *latest = summary.clone(),
            Err(poisoned) => *poisoned.into_inner() = summary.clone(),
        }
        Ok(summary)
    }

    /// Probe every device with a tunnel address under the worker cap. Probes
    /// still running at the cycle deadline are aborted and reported as
    /// recoverable failures.
    async fn probe_all(
        &self,
        devices: &[Device],
        summary: &mut FleetSummary,
    ) -> HashMap<Uuid, ProbeOutcome> {
        let mut outcomes = HashMap::with_capacity(devices.len());
        let permits = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
        let timeout = self.settings.probe_timeout;
        let mut probes = JoinSet::new();
        let mut in_flight = Vec::new();

        for device in devices {
            if device.tunnel_address.is_none() {
                debug!(device_id = %device.id, "no tunnel address, not probing");
                summary.skipped += 1;
                continue;
            }
            summary.probed += 1;

            let target = match ProbeTarget::for_device(device, &self.cipher) {
                Ok(target) => target,
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "device cannot be probed");
                    outcomes.insert(device.id, e.into_outcome());
                    continue;
                }
            };

            in_flight.push(device.id);
            let management = Arc::clone(&self.management);
            let permits = Arc::clone(&permits);
            probes.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (target.device_id, ProbeOutcome::Recoverable("worker pool closed".into()));
                };
                let outcome = match tokio::time::timeout(timeout, management.resources(&target)).await {
                    Ok(Ok(snapshot)) => ProbeOutcome::Alive(snapshot),
                    Ok(Err(e)) => e.into_outcome(),
                    Err(_) => ProbeError::Timeout(timeout).into_outcome(),
                };
                (target.device_id, outcome)
            });
        }

        let deadline = Instant::now() + self.settings.cycle_deadline;
        loop {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok((device_id, outcome)))) => {
                    if let Some(e) = outcome.error() {
                        debug!(%device_id, error = e, "probe failed");
                    }
                    outcomes.insert(device_id, outcome);
                }
                Ok(Some(Err(e))) => error!(error = %e, "probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(unfinished = probes.len(), "cycle deadline reached, abandoning probes");
                    probes.abort_all();
                    break;
                }
            }
        }

        for device_id in in_flight {
            outcomes
                .entry(device_id)
                .or_insert_with(|| ProbeOutcome::Recoverable(DEADLINE_EXCEEDED.into()));
        }
        outcomes
    }
}
