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

//! Canonical active-session view.
//!
//! Two sources feed it: what each online router reports right now (primary)
//! and open rows in the accounting ledger (secondary). A cycle merges both by
//! [`SessionKey`], upserts the union, and only then disconnects rows that
//! dropped out.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleetward_types::{DeviceError, DeviceStatus, SessionKind};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialCipher;
use crate::db::{AccountingLedger, Device, SessionRow, SessionStore, StoreError};
use crate::probe::{Management, ProbeError, ProbeTarget};

/// (device, subscriber identity, peer address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub device_id: Uuid,
    pub identity: String,
    pub peer_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Device,
    Accounting,
}

/// One session as seen by either source this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSession {
    pub key: SessionKey,
    pub mac_address: Option<String>,
    pub kind: SessionKind,
    pub accounting_id: Option<String>,
    pub source: SessionSource,
}

/// A session as a router reports it over the management API.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSession {
    pub identity: String,
    pub peer_address: String,
    pub mac_address: Option<String>,
    pub kind: SessionKind,
}

impl LiveSession {
    pub fn observe(self, device_id: Uuid) -> ObservedSession {
        ObservedSession {
            key: SessionKey {
                device_id,
                identity: self.identity,
                peer_address: self.peer_address,
            },
            mac_address: self.mac_address,
            kind: self.kind,
            accounting_id: None,
            source: SessionSource::Device,
        }
    }
}

/// An open accounting row (no stop time).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingRecord {
    pub session_id: String,
    pub username: String,
    pub nas_address: Ipv4Addr,
    pub framed_address: Option<String>,
    pub calling_station: Option<String>,
    pub kind: SessionKind,
    pub updated_at: DateTime<Utc>,
}

impl AccountingRecord {
    pub fn observe(&self, device_id: Uuid) -> ObservedSession {
        ObservedSession {
            key: SessionKey {
                device_id,
                identity: self.username.clone(),
                peer_address: self.framed_address.clone().unwrap_or_default(),
            },
            mac_address: self.calling_station.clone(),
            kind: self.kind,
            accounting_id: Some(self.session_id.clone()),
            source: SessionSource::Accounting,
        }
    }
}

/// Session kind from RADIUS accounting attributes.
pub fn classify_accounting(
    nas_port_type: Option<&str>,
    framed_protocol: Option<&str>,
    service_type: Option<&str>,
) -> SessionKind {
    if nas_port_type.is_some_and(|t| t.starts_with("Wireless")) {
        return SessionKind::Hotspot;
    }
    if framed_protocol.is_some_and(|p| p.eq_ignore_ascii_case("PPP")) {
        return SessionKind::Pppoe;
    }
    if service_type.is_some_and(|s| s == "Framed-User") {
        return SessionKind::Static;
    }
    SessionKind::Unknown
}

/// Union of both sources by key. Primary entries win; a secondary entry only
/// adds a missing key or fills the accounting id of an existing one.
pub fn merge_sources(
    primary: impl IntoIterator<Item = ObservedSession>,
    secondary: impl IntoIterator<Item = ObservedSession>,
) -> Vec<ObservedSession> {
    let mut union: BTreeMap<SessionKey, ObservedSession> = BTreeMap::new();
    for session in primary {
        union.insert(session.key.clone(), session);
    }
    for session in secondary {
        match union.get_mut(&session.key) {
            Some(existing) => {
                if existing.accounting_id.is_none() {
                    existing.accounting_id = session.accounting_id;
                }
            }
            None => {
                union.insert(session.key.clone(), session);
            }
        }
    }
    union.into_values().collect()
}

/// Oldest update time an open accounting row may have. Windows reaching
/// past the epoch are clamped to it.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |start| {
            start.max(DateTime::<Utc>::UNIX_EPOCH)
        })
}

/// Active rows to flip to disconnected: absent from the union and either on a
/// device enumerated successfully this cycle or idle past `idle_timeout`.
pub fn select_disconnects<'a>(
    active: &'a [SessionRow],
    union: &HashSet<SessionKey>,
    enumerated: &HashSet<Uuid>,
    now: DateTime<Utc>,
    idle_timeout: Duration,
) -> Vec<&'a SessionRow> {
    let idle = TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX);
    active
        .iter()
        .filter(|row| !union.contains(&row.key()))
        .filter(|row| {
            enumerated.contains(&row.device_id) || now.signed_duration_since(row.last_seen) > idle
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub accounting_window: Duration,
    pub idle_timeout: Duration,
    pub enumerate_timeout: Duration,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub active_sessions: i64,
    pub enumerated: usize,
    pub upserted: usize,
    pub disconnected: usize,
    pub orphaned_accounting: usize,
    pub unknown_identities: usize,
    pub errors: Vec<DeviceError>,
}

pub struct SessionReconciler<S, M> {
    store: Arc<S>,
    management: Arc<M>,
    cipher: CredentialCipher,
    settings: ReconcileSettings,
}

impl<S, M> SessionReconciler<S, M>
where
    S: SessionStore + AccountingLedger,
    M: Management,
{
    pub fn new(
        store: Arc<S>,
        management: Arc<M>,
        cipher: CredentialCipher,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            management,
            cipher,
            settings,
        }
    }

    /// Run one cycle over `devices` (the whole fleet with freshly recorded
    /// statuses). Only online devices are enumerated; every device with a
    /// tunnel address can own accounting rows.
    #[tracing::instrument(skip_all, fields(device_count = devices.len()))]
    pub async fn reconcile(
        &self,
        devices: &[Device],
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        let online: Vec<&Device> = devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Online)
            .collect();
        let (primary, enumerated, errors) = self.enumerate(&online).await;
        report.enumerated = enumerated.len();
        report.errors = errors;

        let since = window_start(now, self.settings.accounting_window);
        let records = self.store.open_records(since).await?;

        let by_nas: HashMap<Ipv4Addr, Uuid> = devices
            .iter()
            .filter_map(|d| d.tunnel_address.map(|ip| (ip, d.id)))
            .collect();
        let mut secondary = Vec::with_capacity(records.len());
        let mut orphans = Vec::new();
        for record in records {
            match by_nas.get(&record.nas_address) {
                Some(device_id) => secondary.push(record.observe(*device_id)),
                None => orphans.push(record),
            }
        }
        if !orphans.is_empty() {
            self.store.record_orphans(&orphans, now).await?;
            let nas: BTreeSet<Ipv4Addr> = orphans.iter().map(|r| r.nas_address).collect();
            warn!(
                count = orphans.len(),
                nas_addresses = ?nas,
                "accounting rows matched no device"
            );
        }
        report.orphaned_accounting = orphans.len();

        let union = merge_sources(primary, secondary);
        report.upserted = self.store.upsert_active(&union, now).await?;

        // Only after every enumeration has finished or timed out.
        let union_keys: HashSet<SessionKey> = union.iter().map(|s| s.key.clone()).collect();
        let active = self.store.active_sessions().await?;
        let dropped = select_disconnects(
            &active,
            &union_keys,
            &enumerated,
            now,
            self.settings.idle_timeout,
        );
        let dropped_ids: Vec<Uuid> = dropped.iter().map(|row| row.id).collect();
        report.disconnected = self.store.disconnect(&dropped_ids, now).await?;

        let touched: Vec<String> = union
            .iter()
            .map(|s| s.key.identity.clone())
            .chain(dropped.iter().map(|row| row.identity.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let matched = self.store.refresh_subscriber_flags(&touched).await?;
        report.unknown_identities = touched.len().saturating_sub(matched);
        if report.unknown_identities > 0 {
            debug!(
                count = report.unknown_identities,
                "session identities without a subscriber record"
            );
        }

        report.active_sessions = self.store.count_active().await?;
        if report.active_sessions == 0 {
            let forced = self.store.force_all_offline().await?;
            if forced > 0 {
                info!(forced, "no active sessions left, forced subscribers offline");
            }
        }

        info!(
            active = report.active_sessions,
            upserted = report.upserted,
            disconnected = report.disconnected,
            orphans = report.orphaned_accounting,
            failed = report.errors.len(),
            "session reconciliation complete"
        );
        Ok(report)
    }

    /// Enumerate live sessions on every device concurrently. Returns the
    /// sessions, the ids of devices that answered, and one error per device
    /// that did not.
    async fn enumerate(
        &self,
        online: &[&Device],
    ) -> (Vec<ObservedSession>, HashSet<Uuid>, Vec<DeviceError>) {
        let timeout = self.settings.enumerate_timeout;
        let results: Vec<(Uuid, Result<Vec<LiveSession>, ProbeError>)> =
            futures::stream::iter(online.iter().map(|device| async move {
                let result = match ProbeTarget::for_device(device, &self.cipher) {
                    Ok(target) => {
                        match tokio::time::timeout(
                            timeout,
                            self.management.active_sessions(&target),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ProbeError::Timeout(timeout)),
                        }
                    }
                    Err(e) => Err(e),
                };
                (device.id, result)
            }))
            .buffer_unordered(self.settings.max_workers.max(1))
            .collect()
            .await;

        let mut sessions = Vec::new();
        let mut enumerated = HashSet::new();
        let mut errors = Vec::new();
        for (device_id, result) in results {
            match result {
                Ok(live) => {
                    enumerated.insert(device_id);
                    sessions.extend(live.into_iter().map(|s| s.observe(device_id)));
                }
                Err(e) => {
                    warn!(%device_id, error = %e, "session enumeration failed, keeping previous sessions");
                    errors.push(DeviceError {
                        device_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        (sessions, enumerated, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetward_types::SessionStatus;
    use test_case::test_case;

    fn key(device_id: Uuid, identity: &str, ip: &str) -> SessionKey {
        SessionKey {
            device_id,
            identity: identity.into(),
            peer_address: ip.into(),
        }
    }

    fn observed(key: SessionKey, source: SessionSource, acct: Option<&str>) -> ObservedSession {
        ObservedSession {
            key,
            mac_address: None,
            kind: SessionKind::Hotspot,
            accounting_id: acct.map(Into::into),
            source,
        }
    }

    fn row(key: &SessionKey, seen_secs_ago: i64, now: DateTime<Utc>) -> SessionRow {
        SessionRow {
            id: Uuid::new_v4(),
            device_id: key.device_id,
            identity: key.identity.clone(),
            peer_address: key.peer_address.clone(),
            mac_address: None,
            kind: SessionKind::Hotspot,
            accounting_id: None,
            status: SessionStatus::Active,
            first_seen: now - TimeDelta::hours(1),
            last_seen: now - TimeDelta::seconds(seen_secs_ago),
            ended_at: None,
        }
    }

    #[test_case(Some("Wireless-802.11"), Some("PPP"), None, SessionKind::Hotspot ; "wireless port")]
    #[test_case(Some("Virtual"), Some("PPP"), Some("Framed-User"), SessionKind::Pppoe ; "ppp framed")]
    #[test_case(Some("Ethernet"), None, Some("Framed-User"), SessionKind::Static ; "framed user")]
    #[test_case(None, None, None, SessionKind::Unknown ; "nothing")]
    fn classification(port: Option<&str>, proto: Option<&str>, service: Option<&str>, expected: SessionKind) {
        assert_eq!(classify_accounting(port, proto, service), expected);
    }

    #[test]
    fn primary_wins_secondary_fills_accounting_id() {
        let device = Uuid::new_v4();
        let shared = key(device, "alice", "10.5.50.2");
        let mut primary = observed(shared.clone(), SessionSource::Device, None);
        primary.mac_address = Some("AA:AA:AA:AA:AA:AA".into());
        let mut secondary = observed(shared.clone(), SessionSource::Accounting, Some("acct-1"));
        secondary.mac_address = Some("BB:BB:BB:BB:BB:BB".into());
        secondary.kind = SessionKind::Pppoe;

        let union = merge_sources([primary], [secondary]);
        assert_eq!(union.len(), 1);
        assert_eq!(union[0].source, SessionSource::Device);
        assert_eq!(union[0].mac_address.as_deref(), Some("AA:AA:AA:AA:AA:AA"));
        assert_eq!(union[0].kind, SessionKind::Hotspot);
        assert_eq!(union[0].accounting_id.as_deref(), Some("acct-1"));
    }

    #[test]
    fn secondary_creates_missing_keys() {
        let device = Uuid::new_v4();
        let union = merge_sources(
            [observed(key(device, "alice", "10.5.50.2"), SessionSource::Device, None)],
            [observed(key(device, "bob", "10.5.50.3"), SessionSource::Accounting, Some("acct-2"))],
        );
        assert_eq!(union.len(), 2);
        assert!(union.iter().any(|s| s.key.identity == "bob" && s.source == SessionSource::Accounting));
    }

    #[test]
    fn primary_accounting_id_is_not_overwritten() {
        let k = key(Uuid::new_v4(), "alice", "10.5.50.2");
        let union = merge_sources(
            [observed(k.clone(), SessionSource::Device, Some("device-side"))],
            [observed(k, SessionSource::Accounting, Some("ledger-side"))],
        );
        assert_eq!(union[0].accounting_id.as_deref(), Some("device-side"));
    }

    #[test]
    fn empty_poll_disconnects_everything_on_that_device() {
        let now = Utc::now();
        let device = Uuid::new_v4();
        let rows = vec![
            row(&key(device, "alice", "10.5.50.2"), 30, now),
            row(&key(device, "bob", "10.5.50.3"), 30, now),
        ];
        let enumerated = HashSet::from([device]);
        let dropped = select_disconnects(&rows, &HashSet::new(), &enumerated, now, Duration::from_secs(900));
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn failed_enumeration_keeps_recent_rows() {
        let now = Utc::now();
        let device = Uuid::new_v4();
        let rows = vec![row(&key(device, "alice", "10.5.50.2"), 30, now)];
        let dropped = select_disconnects(&rows, &HashSet::new(), &HashSet::new(), now, Duration::from_secs(900));
        assert!(dropped.is_empty());
    }

    #[test]
    fn window_start_subtracts_window() {
        let now = Utc::now();
        assert_eq!(window_start(now, Duration::from_secs(600)), now - TimeDelta::seconds(600));
    }

    #[test_case(Duration::from_secs(u64::MAX) ; "beyond chrono range")]
    #[test_case(Duration::from_secs(100 * 365 * 24 * 3600) ; "before epoch")]
    fn oversized_window_clamps_to_epoch(window: Duration) {
        assert_eq!(window_start(Utc::now(), window), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn failed_enumeration_still_honours_idle_timeout() {
        let now = Utc::now();
        let device = Uuid::new_v4();
        let rows = vec![row(&key(device, "alice", "10.5.50.2"), 901, now)];
        let dropped = select_disconnects(&rows, &HashSet::new(), &HashSet::new(), now, Duration::from_secs(900));
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn rows_in_union_are_kept() {
        let now = Utc::now();
        let device = Uuid::new_v4();
        let k = key(device, "alice", "10.5.50.2");
        let rows = vec![row(&k, 5000, now)];
        let union = HashSet::from([k]);
        let dropped = select_disconnects(&rows, &union, &HashSet::from([device]), now, Duration::from_secs(900));
        assert!(dropped.is_empty());
    }

    #[test]
    fn accounting_record_without_framed_address() {
        let device = Uuid::new_v4();
        let record = AccountingRecord {
            session_id: "acct-9".into(),
            username: "carol".into(),
            nas_address: "10.99.0.2".parse().unwrap(),
            framed_address: None,
            calling_station: Some("CC:CC:CC:CC:CC:CC".into()),
            kind: SessionKind::Static,
            updated_at: Utc::now(),
        };
        let observed = record.observe(device);
        assert_eq!(observed.key, key(device, "carol", ""));
        assert_eq!(observed.accounting_id.as_deref(), Some("acct-9"));
        assert_eq!(observed.source, SessionSource::Accounting);
    }
}
