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

//! Device → peer mapping for the hub interface.
//!
//! The configuration file has exactly one writer: every mutation goes through
//! the [`PeerStore`] mutex, and a batch holds it from the first staged peer
//! to the single commit.

pub mod wgconf;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TunnelSettings;
use crate::db::{Device, DeviceStore, StoreError};
use crate::platform::{Platform, PlatformError};
use wgconf::{WgConfError, WgConfig, WgInterface, WgPeer, decode_key};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("device {0} has no public key or tunnel address yet")]
    Incomplete(Uuid),

    #[error(transparent)]
    Config(#[from] WgConfError),

    #[error("staged configuration changed on re-read")]
    Mismatch,

    #[error("interface reload failed: {0}")]
    Reload(#[from] PlatformError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

struct PeerState {
    /// Last configuration that was reloaded and renamed into place.
    live: Vec<WgPeer>,
    /// Desired peers by device; committed on the next successful apply.
    staged: BTreeMap<Uuid, WgPeer>,
    dirty: bool,
}

pub struct PeerStore<P> {
    settings: TunnelSettings,
    state: Mutex<PeerState>,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform> PeerStore<P> {
    /// Load the live file (if any) as the starting point. Peers without a
    /// device comment are dropped on the next commit.
    pub async fn open(settings: TunnelSettings) -> Result<Self, PeerError> {
        let path = settings.config_path.clone();
        let live = match tokio::fs::read_to_string(&path).await {
            Ok(text) => WgConfig::parse(&text)?.peers,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no hub config yet, starting empty");
                Vec::new()
            }
            Err(source) => return Err(PeerError::Io { path, source }),
        };
        let staged = live
            .iter()
            .filter_map(|p| p.device_id.map(|id| (id, p.clone())))
            .collect();
        debug!(peer_count = live.len(), "loaded hub peers");

        Ok(Self {
            settings,
            state: Mutex::new(PeerState {
                live,
                staged,
                dirty: false,
            }),
            _platform: PhantomData,
        })
    }

    /// Take the single-writer lock for a batch of changes.
    pub async fn batch(&self) -> PeerBatch<'_, P> {
        PeerBatch {
            store: self,
            state: self.state.lock().await,
        }
    }

    /// Stage the peer for `device`; with `reload` commit right away.
    /// Returns whether the staged set changed.
    #[tracing::instrument(skip(self, device), fields(device_id = %device.id))]
    pub async fn apply_peer(&self, device: &Device, reload: bool) -> Result<bool, PeerError> {
        let mut batch = self.batch().await;
        let changed = batch.stage(device)?;
        if reload {
            batch.commit().await?;
        }
        Ok(changed)
    }

    pub async fn remove_peer(&self, device_id: Uuid, reload: bool) -> Result<bool, PeerError> {
        let mut batch = self.batch().await;
        let changed = batch.unstage(device_id);
        if reload {
            batch.commit().await?;
        }
        Ok(changed)
    }

    /// Commit whatever is staged.
    pub async fn apply_config_safely(&self) -> Result<(), PeerError> {
        self.batch().await.commit().await
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn live_peers(&self) -> Vec<WgPeer> {
        self.state.lock().await.live.clone()
    }

    /// Diff the live file against the device table and commit the result.
    /// The device table is read under the writer lock so a peer committed
    /// meanwhile is part of the desired set.
    #[tracing::instrument(skip_all)]
    pub async fn reconcile_all<S: DeviceStore>(
        &self,
        store: &S,
    ) -> Result<PeerReconcileReport, PeerError> {
        let mut batch = self.batch().await;
        let devices = store.list_devices().await?;
        let mut report = PeerReconcileReport::default();

        let mut desired: BTreeMap<Uuid, WgPeer> = BTreeMap::new();
        for device in &devices {
            if device.public_key.is_none() || device.tunnel_address.is_none() {
                continue;
            }
            match self.peer_for(device) {
                Ok(peer) => {
                    desired.insert(device.id, peer);
                }
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "skipping device with unusable peer data");
                    report.failed += 1;
                    report.errors.push(format!("{}: {e}", device.id));
                }
            }
        }

        let live: BTreeMap<Option<Uuid>, &WgPeer> =
            batch.state.live.iter().map(|p| (p.device_id, p)).collect();

        let (mut added, mut updated) = (0, 0);
        for (id, peer) in &desired {
            match live.get(&Some(*id)) {
                None => added += 1,
                Some(current) if *current != peer => updated += 1,
                Some(_) => {}
            }
        }
        let removed = batch
            .state
            .live
            .iter()
            .filter(|p| p.device_id.is_none_or(|id| !desired.contains_key(&id)))
            .count();
        drop(live);

        let changes = added + updated + removed;
        let needs_commit = changes > 0 || batch.state.dirty;
        batch.state.staged = desired;
        batch.state.dirty = needs_commit;

        if needs_commit {
            if let Err(e) = batch.commit().await {
                error!(error = %e, pending = changes, "peer reconciliation could not be applied");
                report.failed += changes;
                report.errors.push(e.to_string());
                return Ok(report);
            }
        }

        report.added = added;
        report.updated = updated;
        report.removed = removed;
        info!(
            added,
            updated,
            removed,
            failed = report.failed,
            "peer reconciliation complete"
        );
        Ok(report)
    }

    fn peer_for(&self, device: &Device) -> Result<WgPeer, PeerError> {
        let (Some(key), Some(address)) = (&device.public_key, device.tunnel_address) else {
            return Err(PeerError::Incomplete(device.id));
        };
        decode_key(key)?;
        let allowed_ip = Ipv4Network::new(address, 32)
            .map_err(|e| WgConfError::CidrParse(e.to_string()))?;
        Ok(WgPeer {
            device_id: Some(device.id),
            public_key: key.clone(),
            allowed_ip,
            persistent_keepalive: self.settings.persistent_keepalive,
        })
    }

    fn interface(&self) -> Result<WgInterface, PeerError> {
        let address = Ipv4Network::new(self.settings.hub_address(), self.settings.subnet.prefix())
            .map_err(|e| WgConfError::CidrParse(e.to_string()))?;
        Ok(WgInterface {
            private_key: self.settings.private_key.clone(),
            address,
            listen_port: self.settings.listen_port,
        })
    }
}

/// Holds the configuration lock; staged changes are written by
/// [`PeerBatch::commit`].
pub struct PeerBatch<'a, P> {
    store: &'a PeerStore<P>,
    state: MutexGuard<'a, PeerState>,
}

impl<P: Platform> PeerBatch<'_, P> {
    pub fn stage(&mut self, device: &Device) -> Result<bool, PeerError> {
        let peer = self.store.peer_for(device)?;
        if self.state.staged.get(&device.id) == Some(&peer) {
            return Ok(false);
        }
        // a key or address can only belong to one device
        self.state.staged.retain(|id, p| {
            *id == device.id || (p.public_key != peer.public_key && p.allowed_ip != peer.allowed_ip)
        });
        self.state.staged.insert(device.id, peer);
        self.state.dirty = true;
        Ok(true)
    }

    pub fn unstage(&mut self, device_id: Uuid) -> bool {
        let removed = self.state.staged.remove(&device_id).is_some();
        if removed {
            self.state.dirty = true;
        }
        removed
    }

    /// Render the staged peers to `<path>.next`, validate, reload the
    /// interface from it and rename it over the live file. Any failure
    /// leaves the live file and the staged set as they were.
    pub async fn commit(&mut self) -> Result<(), PeerError> {
        if !self.state.dirty {
            debug!("nothing staged");
            return Ok(());
        }

        let mut peers: Vec<WgPeer> = self.state.staged.values().cloned().collect();
        peers.sort_by_key(|p| p.address());
        let config = WgConfig {
            interface: self.store.interface()?,
            peers,
        };
        config.validate()?;

        let path = self.store.settings.config_path.as_path();
        let next = next_path(path);
        let result = write_and_reload::<P>(&self.store.settings.interface, &config, path, &next).await;
        if let Err(e) = result {
            if let Err(cleanup) = tokio::fs::remove_file(&next).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %next.display(), error = %cleanup, "failed to remove staged config");
            }
            error!(error = %e, "hub config not applied, keeping previous configuration");
            return Err(e);
        }

        info!(
            interface = %self.store.settings.interface,
            peer_count = config.peers.len(),
            "hub config applied"
        );
        self.state.live = config.peers;
        self.state.dirty = false;
        Ok(())
    }
}

fn next_path(path: &Path) -> PathBuf {
    let mut next = path.as_os_str().to_owned();
    next.push(".next");
    PathBuf::from(next)
}

async fn write_and_reload<P: Platform>(
    interface: &str,
    config: &WgConfig,
    path: &Path,
    next: &Path,
) -> Result<(), PeerError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PeerError::Io { path, source }
    };

    if let Some(parent) = next.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io(parent))?;
    }
    tokio::fs::write(next, config.render()).await.map_err(io(next))?;

    let text = tokio::fs::read_to_string(next).await.map_err(io(next))?;
    let reread = WgConfig::parse(&text)?;
    reread.validate()?;
    if reread != *config {
        return Err(PeerError::Mismatch);
    }

    P::reload_interface(interface, &reread).await?;
    tokio::fs::rename(next, path).await.map_err(io(path))?;
    Ok(())
}
