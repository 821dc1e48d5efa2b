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

use std::future::Future;

use thiserror::Error;

use crate::nat::NatRule;
use crate::peers::wgconf::{WgConfError, WgConfig};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] WgConfError),

    #[error("firewall command failed: {0}")]
    Firewall(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host side effects: the hub WireGuard interface and the NAT table.
pub trait Platform: Send + Sync + 'static {
    /// Bring `name` up with exactly the peers in `config`.
    fn reload_interface(
        name: &str,
        config: &WgConfig,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn interface_exists(name: &str) -> impl Future<Output = Result<bool, PlatformError>> + Send;

    fn nat_rule_present(rule: &NatRule) -> impl Future<Output = Result<bool, PlatformError>> + Send;

    fn insert_nat_rule(rule: &NatRule) -> impl Future<Output = Result<(), PlatformError>> + Send;

    fn delete_nat_rule(rule: &NatRule) -> impl Future<Output = Result<(), PlatformError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentPlatform = linux::LinuxPlatform;

#[cfg(not(target_os = "linux"))]
pub type CurrentPlatform = StubPlatform;

// -- Stub platform for non-Linux --

pub struct StubPlatform;

impl Platform for StubPlatform {
    async fn reload_interface(_name: &str, _config: &WgConfig) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn interface_exists(_name: &str) -> Result<bool, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn nat_rule_present(_rule: &NatRule) -> Result<bool, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn insert_nat_rule(_rule: &NatRule) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn delete_nat_rule(_rule: &NatRule) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::IpAddr;

    use futures::TryStreamExt;
    use tokio::process::Command;
    use tracing::{debug, info};
    use wireguard_uapi::{RouteSocket, WgSocket, set};

    use super::{Platform, PlatformError};
    use crate::nat::NatRule;
    use crate::peers::wgconf::{WgConfig, decode_key};

    pub struct LinuxPlatform;

    impl Platform for LinuxPlatform {
        async fn reload_interface(name: &str, config: &WgConfig) -> Result<(), PlatformError> {
            ensure_interface(name)?;
            apply_device_config(name, config)?;
            assign_address(name, config).await?;
            set_link_up(name).await?;
            info!(
                interface = name,
                peer_count = config.peers.len(),
                "reloaded hub interface"
            );
            Ok(())
        }

        async fn interface_exists(name: &str) -> Result<bool, PlatformError> {
            let mut route =
                RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
            Ok(existing.iter().any(|n| n == name))
        }

        async fn nat_rule_present(rule: &NatRule) -> Result<bool, PlatformError> {
            // iptables -C exits 1 when the rule is absent
            let status = iptables("-C", rule).await?;
            match status.code() {
                Some(0) => Ok(true),
                Some(1) => Ok(false),
                _ => Err(PlatformError::Firewall(format!(
                    "iptables -C {} exited with {status}",
                    rule.chain()
                ))),
            }
        }

        async fn insert_nat_rule(rule: &NatRule) -> Result<(), PlatformError> {
            let status = iptables("-A", rule).await?;
            if !status.success() {
                return Err(PlatformError::Firewall(format!(
                    "iptables -A {} exited with {status}",
                    rule.chain()
                )));
            }
            debug!(chain = rule.chain(), device_id = %rule.device_id(), "inserted nat rule");
            Ok(())
        }

        async fn delete_nat_rule(rule: &NatRule) -> Result<(), PlatformError> {
            let status = iptables("-D", rule).await?;
            if !status.success() {
                return Err(PlatformError::Firewall(format!(
                    "iptables -D {} exited with {status}",
                    rule.chain()
                )));
            }
            debug!(chain = rule.chain(), device_id = %rule.device_id(), "deleted nat rule");
            Ok(())
        }
    }

    async fn iptables(action: &str, rule: &NatRule) -> Result<std::process::ExitStatus, PlatformError> {
        let output = Command::new("iptables")
            .args(["-w", "-t", "nat", action, rule.chain()])
            .args(rule.match_args())
            .output()
            .await?;
        if !output.stderr.is_empty() {
            debug!(
                action,
                chain = rule.chain(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "iptables stderr"
            );
        }
        Ok(output.status)
    }

    fn ensure_interface(name: &str) -> Result<(), PlatformError> {
        let mut route =
            RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        let existing = route
            .list_device_names()
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        if existing.iter().any(|n| n == name) {
            debug!(interface = name, "interface already exists");
            return Ok(());
        }

        info!(interface = name, "creating wireguard interface");
        route
            .add_device(name)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(())
    }

    fn apply_device_config(name: &str, config: &WgConfig) -> Result<(), PlatformError> {
        let private_key = decode_key(&config.interface.private_key)?;

        let peer_data: Vec<PeerOwned> = config
            .peers
            .iter()
            .map(|p| {
                Ok(PeerOwned {
                    pub_key: decode_key(&p.public_key)?,
                    address: IpAddr::V4(p.allowed_ip.ip()),
                    prefix: p.allowed_ip.prefix(),
                    persistent_keepalive: p.persistent_keepalive,
                })
            })
            .collect::<Result<_, PlatformError>>()?;

        let peers: Vec<set::Peer<'_>> = peer_data
            .iter()
            .map(|p| {
                let mut peer = set::Peer::from_public_key(&p.pub_key)
                    .flags(vec![set::WgPeerF::ReplaceAllowedIps]);

                let mut aip = set::AllowedIp::from_ipaddr(&p.address);
                aip.cidr_mask = Some(p.prefix);

                if p.persistent_keepalive > 0 {
                    peer = peer.persistent_keepalive_interval(p.persistent_keepalive);
                }

                peer.allowed_ips(vec![aip])
            })
            .collect();

        let dev = set::Device::from_ifname(name)
            .private_key(&private_key)
            .listen_port(config.interface.listen_port)
            .flags(vec![set::WgDeviceF::ReplacePeers])
            .peers(peers);

        let mut wg = WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(
            interface = name,
            listen_port = config.interface.listen_port,
            peer_count = config.peers.len(),
            "applied wireguard device config"
        );
        Ok(())
    }

    struct PeerOwned {
        pub_key: [u8; 32],
        address: IpAddr,
        prefix: u8,
        persistent_keepalive: u16,
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, PlatformError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?
            .ok_or_else(|| PlatformError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, config: &WgConfig) -> Result<(), PlatformError> {
        let addr = IpAddr::V4(config.interface.address.ip());
        let prefix = config.interface.address.prefix();

        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
        }
        debug!(interface = name, "flushed existing addresses");

        handle
            .address()
            .add(index, addr, prefix)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(interface = name, %addr, prefix, "assigned hub address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let msg = rtnetlink::LinkUnspec::new_with_index(index).up().build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        debug!(interface = name, "set link up via netlink");
        Ok(())
    }
}
