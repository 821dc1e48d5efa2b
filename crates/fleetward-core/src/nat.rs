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

//! Public console port forwarding.
//!
//! Each device with a tunnel address gets one public TCP port. Traffic to
//! `public_address:port` is DNATed to `tunnel_address:console_port`, and
//! SNATed to the hub tunnel address so the reply comes back through the
//! tunnel. A mapping is either fully installed or not at all.

use std::marker::PhantomData;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alloc::lowest_free_port;
use crate::db::{Device, DeviceStore, StoreError};
use crate::platform::{Platform, PlatformError};

const MAX_CLAIM_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("no free console ports left in {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("device {0} has no tunnel address")]
    NoTunnelAddress(Uuid),

    #[error("nat rule operation failed: {0}")]
    Platform(#[from] PlatformError),

    #[error("nat rules for device {device_id} left half installed: {detail}")]
    Drift { device_id: Uuid, detail: String },

    #[error("could not reserve a console port after {0} attempts")]
    Conflict(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule {
    Dnat {
        device_id: Uuid,
        public_address: Ipv4Addr,
        public_port: u16,
        target: Ipv4Addr,
        target_port: u16,
    },
    Snat {
        device_id: Uuid,
        target: Ipv4Addr,
        target_port: u16,
        hub: Ipv4Addr,
    },
}

impl NatRule {
    pub fn device_id(&self) -> Uuid {
        match self {
            Self::Dnat { device_id, .. } | Self::Snat { device_id, .. } => *device_id,
        }
    }

    pub fn chain(&self) -> &'static str {
        match self {
            Self::Dnat { .. } => "PREROUTING",
            Self::Snat { .. } => "POSTROUTING",
        }
    }

    /// Rule specification after the chain name, identical for `-A`, `-C` and
    /// `-D`.
    pub fn match_args(&self) -> Vec<String> {
        let comment = format!("fleetward:{}", self.device_id());
        match self {
            Self::Dnat {
                public_address,
                public_port,
                target,
                target_port,
                ..
            } => vec![
                "-d".into(),
                public_address.to_string(),
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                public_port.to_string(),
                "-m".into(),
                "comment".into(),
                "--comment".into(),
                comment,
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                format!("{target}:{target_port}"),
            ],
            Self::Snat {
                target,
                target_port,
                hub,
                ..
            } => vec![
                "-d".into(),
                target.to_string(),
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                target_port.to_string(),
                "-m".into(),
                "comment".into(),
                "--comment".into(),
                comment,
                "-j".into(),
                "SNAT".into(),
                "--to-source".into(),
                hub.to_string(),
            ],
        }
    }
}

/// The DNAT/SNAT pair for `device` on `public_port`.
pub fn rule_pair(
    device: &Device,
    public_address: Ipv4Addr,
    public_port: u16,
    hub: Ipv4Addr,
) -> Result<(NatRule, NatRule), NatError> {
    let target = device
        .tunnel_address
        .ok_or(NatError::NoTunnelAddress(device.id))?;
    Ok((
        NatRule::Dnat {
            device_id: device.id,
            public_address,
            public_port,
            target,
            target_port: device.console_port,
        },
        NatRule::Snat {
            device_id: device.id,
            target,
            target_port: device.console_port,
            hub,
        },
    ))
}

pub struct PortAllocator<P> {
    public_address: Ipv4Addr,
    hub: Ipv4Addr,
    ports: RangeInclusive<u16>,
    lock: Mutex<()>,
    _platform: PhantomData<fn() -> P>,
}

impl<P: Platform> PortAllocator<P> {
    pub fn new(public_address: Ipv4Addr, hub: Ipv4Addr, ports: RangeInclusive<u16>) -> Self {
        Self {
            public_address,
            hub,
            ports,
            lock: Mutex::new(()),
            _platform: PhantomData,
        }
    }

    /// Make sure `device` has a public port with both rules installed.
    /// Returns the public port.
    #[tracing::instrument(skip(self, store, device), fields(device_id = %device.id))]
    pub async fn ensure_mapping<S: DeviceStore>(
        &self,
        store: &S,
        device: &Device,
    ) -> Result<u16, NatError> {
        let _guard = self.lock.lock().await;
        let current = store.get_device(device.id).await?;
        let device = current.as_ref().unwrap_or(device);

        if device.tunnel_address.is_none() {
            return Err(NatError::NoTunnelAddress(device.id));
        }

        if let Some(port) = device.public_port {
            self.repair(device, port).await?;
            return Ok(port);
        }

        let mut used = store.used_public_ports().await?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let Some(port) = lowest_free_port(&self.ports, used.iter().copied()) else {
                warn!(start = *self.ports.start(), end = *self.ports.end(), "console port range exhausted");
                return Err(NatError::Exhausted {
                    start: *self.ports.start(),
                    end: *self.ports.end(),
                });
            };

            let (dnat, snat) = rule_pair(device, self.public_address, port, self.hub)?;
            self.install_pair(device.id, &dnat, &snat).await?;

            if store.assign_public_port(device.id, port).await? {
                info!(public_port = port, "console port mapped");
                return Ok(port);
            }

            // someone else persisted this port first
            warn!(public_port = port, "console port taken concurrently, retrying");
            self.remove_pair(device.id, &dnat, &snat).await?;
            used = store.used_public_ports().await?;
            if !used.contains(&port) {
                used.push(port);
            }
        }
        Err(NatError::Conflict(MAX_CLAIM_ATTEMPTS))
    }

    /// Remove both rules and free the port. Both removals are attempted even
    /// if the first fails.
    #[tracing::instrument(skip(self, store, device), fields(device_id = %device.id))]
    pub async fn remove_mapping<S: DeviceStore>(
        &self,
        store: &S,
        device: &Device,
    ) -> Result<(), NatError> {
        let _guard = self.lock.lock().await;
        let current = store.get_device(device.id).await?;
        let device = current.as_ref().unwrap_or(device);

        let Some(port) = device.public_port else {
            debug!("no console port mapped");
            return Ok(());
        };
        let (dnat, snat) = rule_pair(device, self.public_address, port, self.hub)?;
        self.remove_pair(device.id, &dnat, &snat).await?;
        store.clear_public_port(device.id).await?;
        info!(public_port = port, "console port released");
        Ok(())
    }

    /// Re-install whichever rule of an existing mapping is missing.
    async fn repair(&self, device: &Device, port: u16) -> Result<(), NatError> {
        let (dnat, snat) = rule_pair(device, self.public_address, port, self.hub)?;
        let dnat_ok = P::nat_rule_present(&dnat).await?;
        let snat_ok = P::nat_rule_present(&snat).await?;
        match (dnat_ok, snat_ok) {
            (true, true) => {
                debug!(public_port = port, "console mapping intact");
                Ok(())
            }
            (false, false) => {
                warn!(public_port = port, "console mapping missing, reinstalling");
                self.install_pair(device.id, &dnat, &snat).await
            }
            (false, true) => {
                warn!(public_port = port, "dnat rule missing, reinstalling");
                P::insert_nat_rule(&dnat).await?;
                Ok(())
            }
            (true, false) => {
                warn!(public_port = port, "snat rule missing, reinstalling");
                P::insert_nat_rule(&snat).await?;
                Ok(())
            }
        }
    }

    /// DNAT then SNAT; a failed SNAT rolls the DNAT back.
    async fn install_pair(&self, device_id: Uuid, dnat: &NatRule, snat: &NatRule) -> Result<(), NatError> {
        P::insert_nat_rule(dnat).await?;
        if let Err(e) = P::insert_nat_rule(snat).await {
            if let Err(rollback) = P::delete_nat_rule(dnat).await {
                error!(%device_id, error = %rollback, "failed to roll back dnat rule");
                return Err(NatError::Drift {
                    device_id,
                    detail: format!("snat insert failed ({e}), dnat rollback failed ({rollback})"),
                });
            }
            return Err(NatError::Platform(e));
        }
        Ok(())
    }

    async fn remove_pair(&self, device_id: Uuid, dnat: &NatRule, snat: &NatRule) -> Result<(), NatError> {
        let dnat_result = P::delete_nat_rule(dnat).await;
        let snat_result = P::delete_nat_rule(snat).await;
        match (dnat_result, snat_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(NatError::Drift {
                device_id,
                detail: e.to_string(),
            }),
            (Err(d), Err(s)) => Err(NatError::Drift {
                device_id,
                detail: format!("dnat: {d}; snat: {s}"),
            }),
        }
    }
}
