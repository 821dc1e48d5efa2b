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

//! Per-device operations driven by the HTTP surface: onboarding, removal and
//! the device callbacks.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fleetward_types::callback::{HeartbeatRequest, PhoneHomeRequest, PhoneHomeResponse};
use fleetward_types::{DeviceView, OnboardingInfo, SubscriberView};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alloc::{AllocError, allocate_address};
use crate::config::FleetSettings;
use crate::credentials::generate_callback_token;
use crate::db::{Device, FleetStore, StoreError};
use crate::nat::{NatError, PortAllocator};
use crate::peers::wgconf::{WgConfError, decode_key, derive_public_key};
use crate::peers::{PeerError, PeerStore};
use crate::platform::Platform;

/// Shown in place of the device key until the device phones home.
pub const PUBLIC_KEY_PLACEHOLDER: &str = "pending";

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("device not found")]
    DeviceNotFound,

    #[error("invalid or revoked callback token")]
    Unauthorized,

    #[error("invalid public key: {0}")]
    InvalidKey(WgConfError),

    #[error("tunnel address rejected: {0}")]
    AddressRejected(String),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Nat(#[from] NatError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Fleet<S, P> {
    store: Arc<S>,
    peers: Arc<PeerStore<P>>,
    ports: Arc<PortAllocator<P>>,
    settings: FleetSettings,
    hub_public_key: String,
    /// Devices with a peer apply in flight; `true` asks the running task to
    /// go around once more.
    pending_applies: Arc<DashMap<Uuid, bool>>,
}

impl<S: FleetStore, P: Platform> Fleet<S, P> {
    pub fn new(
        store: Arc<S>,
        peers: Arc<PeerStore<P>>,
        ports: Arc<PortAllocator<P>>,
        settings: FleetSettings,
    ) -> Result<Self, PeerError> {
        let hub_public_key = derive_public_key(&settings.tunnel.private_key)?;
        Ok(Self {
            store,
            peers,
            ports,
            settings,
            hub_public_key,
            pending_applies: Arc::new(DashMap::new()),
        })
    }

    pub fn peers(&self) -> &Arc<PeerStore<P>> {
        &self.peers
    }

    async fn device(&self, id: Uuid) -> Result<Device, FleetError> {
        self.store
            .get_device(id)
            .await?
            .ok_or(FleetError::DeviceNotFound)
    }

    /// Allocate the tunnel address and console port. Safe to repeat: both
    /// allocations hand back what the device already holds.
    #[tracing::instrument(skip(self))]
    pub async fn onboard(&self, device_id: Uuid) -> Result<OnboardingInfo, FleetError> {
        let tunnel_address =
            allocate_address(self.store.as_ref(), device_id, self.settings.tunnel.subnet).await?;
        let device = self.device(device_id).await?;

        let console_port = match self.ports.ensure_mapping(self.store.as_ref(), &device).await {
            Ok(port) => port,
            Err(e) => {
                self.store.set_last_error(device_id, Some(&e.to_string())).await?;
                return Err(e.into());
            }
        };

        let callback_token = match device.callback_token {
            Some(token) => token,
            None => {
                let token = generate_callback_token();
                self.store.set_callback_token(device_id, &token).await?;
                token
            }
        };

        info!(%tunnel_address, console_port, "device onboarded");
        Ok(OnboardingInfo {
            device_id,
            tunnel_address,
            tunnel_prefix: self.settings.tunnel.subnet.prefix(),
            public_key: device
                .public_key
                .unwrap_or_else(|| PUBLIC_KEY_PLACEHOLDER.to_string()),
            hub_public_key: self.hub_public_key.clone(),
            hub_endpoint: self.settings.tunnel.endpoint.clone(),
            console_port,
            callback_token,
        })
    }

    /// Remove the console mapping, soft-delete the device and drop its peer.
    /// A mapping that cannot be removed aborts before anything is deleted.
    #[tracing::instrument(skip(self))]
    pub async fn decommission(&self, device_id: Uuid) -> Result<(), FleetError> {
        let device = self.device(device_id).await?;
        self.ports.remove_mapping(self.store.as_ref(), &device).await?;
        if !self.store.soft_delete(device_id).await? {
            return Err(FleetError::DeviceNotFound);
        }
        self.peers.remove_peer(device_id, true).await?;
        info!("device decommissioned");
        Ok(())
    }

    /// Store the key a device reports and apply its peer in the background.
    #[tracing::instrument(skip_all)]
    pub async fn phone_home(
        &self,
        token: &str,
        request: &PhoneHomeRequest,
    ) -> Result<PhoneHomeResponse, FleetError> {
        let device = self
            .store
            .get_device_by_token(token)
            .await?
            .ok_or(FleetError::Unauthorized)?;
        let device_id = device.id;

        decode_key(&request.public_key).map_err(FleetError::InvalidKey)?;
        let address = self.resolve_address(&device, request.tunnel_address.as_deref()).await?;

        self.store.set_public_key(device_id, request.public_key.trim()).await?;
        info!(%device_id, %address, "device phoned home");
        self.schedule_peer_apply(device_id);

        Ok(PhoneHomeResponse {
            address: format!("{address}/{}", self.settings.tunnel.subnet.prefix()),
            hub_public_key: self.hub_public_key.clone(),
            hub_endpoint: self.settings.tunnel.endpoint.clone(),
            allowed_ips: vec![self.settings.tunnel.subnet.to_string()],
            persistent_keepalive: self.settings.tunnel.persistent_keepalive,
        })
    }

    /// A negotiated address is accepted when it equals the allocated one, or
    /// when the device has none and the address is a free host in the subnet.
    async fn resolve_address(
        &self,
        device: &Device,
        reported: Option<&str>,
    ) -> Result<Ipv4Addr, FleetError> {
        let subnet = self.settings.tunnel.subnet;
        let Some(reported) = reported.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(allocate_address(self.store.as_ref(), device.id, subnet).await?);
        };

        // "10.99.0.7" or "10.99.0.7/16"
        let host = reported.split_once('/').map_or(reported, |(ip, _)| ip);
        let address: Ipv4Addr = host
            .parse()
            .map_err(|_| FleetError::AddressRejected(format!("{reported:?} is not an IPv4 address")))?;

        if let Some(allocated) = device.tunnel_address {
            if allocated != address {
                return Err(FleetError::AddressRejected(format!(
                    "{address} differs from allocated {allocated}"
                )));
            }
            return Ok(address);
        }

        let hub = self.settings.tunnel.hub_address();
        if !subnet.contains(address)
            || address == subnet.network()
            || address == subnet.broadcast()
            || address == hub
        {
            return Err(FleetError::AddressRejected(format!(
                "{address} is not a usable host in {subnet}"
            )));
        }
        if !self.store.claim_address(device.id, address).await? {
            return Err(FleetError::AddressRejected(format!("{address} is already in use")));
        }
        info!(device_id = %device.id, %address, "accepted device-negotiated tunnel address");
        Ok(address)
    }

    /// Run `apply_peer` for the device off the request path. Concurrent
    /// requests for the same device fold into one task that re-reads the
    /// device until no new request arrived while it was applying.
    fn schedule_peer_apply(&self, device_id: Uuid) {
        match self.pending_applies.entry(device_id) {
            Entry::Occupied(mut rerun) => {
                *rerun.get_mut() = true;
                debug!(%device_id, "peer apply already in flight");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let store = Arc::clone(&self.store);
        let peers = Arc::clone(&self.peers);
        let pending = Arc::clone(&self.pending_applies);
        tokio::spawn(async move {
            loop {
                match store.get_device(device_id).await {
                    Ok(Some(device)) => match peers.apply_peer(&device, true).await {
                        Ok(changed) => {
                            debug!(%device_id, changed, "peer applied");
                            if let Err(e) = store.set_last_error(device_id, None).await {
                                warn!(%device_id, error = %e, "failed to clear last error");
                            }
                        }
                        Err(e) => {
                            warn!(%device_id, error = %e, "peer apply failed, left for next resync");
                            if let Err(e) = store.set_last_error(device_id, Some(&e.to_string())).await {
                                warn!(%device_id, error = %e, "failed to record peer error");
                            }
                        }
                    },
                    Ok(None) => debug!(%device_id, "device gone before peer apply"),
                    Err(e) => warn!(%device_id, error = %e, "failed to load device for peer apply"),
                }

                if pending.remove_if(&device_id, |_, rerun| !*rerun).is_some() {
                    break;
                }
                match pending.get_mut(&device_id) {
                    Some(mut rerun) => *rerun = false,
                    None => break,
                }
            }
        });
    }

    /// Devices with a background peer apply still running.
    pub fn pending_peer_applies(&self) -> usize {
        self.pending_applies.len()
    }

    /// Record the address the device is seen from. Diagnostics only.
    #[tracing::instrument(skip_all)]
    pub async fn heartbeat(&self, token: &str, request: &HeartbeatRequest) -> Result<Uuid, FleetError> {
        let device = self
            .store
            .get_device_by_token(token)
            .await?
            .ok_or(FleetError::Unauthorized)?;
        self.store
            .record_heartbeat(device.id, request.public_address.as_deref(), Utc::now())
            .await?;
        debug!(device_id = %device.id, public_address = ?request.public_address, "heartbeat");
        Ok(device.id)
    }

    pub async fn device_views(&self) -> Result<Vec<DeviceView>, FleetError> {
        Ok(self
            .store
            .list_devices()
            .await?
            .iter()
            .map(Device::view)
            .collect())
    }

    pub async fn device_view(&self, device_id: Uuid) -> Result<DeviceView, FleetError> {
        Ok(self.device(device_id).await?.view())
    }

    pub async fn subscriber(&self, identity: &str) -> Result<Option<SubscriberView>, FleetError> {
        Ok(self.store.subscriber(identity).await?)
    }
}
