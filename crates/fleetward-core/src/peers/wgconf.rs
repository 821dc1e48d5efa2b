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

//! The hub's WireGuard configuration file (wg-quick syntax).
//!
//! Each `[Peer]` is preceded by a `# device = <uuid>` comment so the file can
//! be diffed against the device table.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ipnetwork::Ipv4Network;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WgConfError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("CIDR parse error: {0}")]
    CidrParse(String),

    #[error("peer allowed-ip {0} is not a single host")]
    NotHost(Ipv4Network),

    #[error("peer address {0} is outside {1}")]
    OutsideSubnet(Ipv4Addr, Ipv4Network),

    #[error("duplicate peer public key {0}")]
    DuplicateKey(String),

    #[error("duplicate peer address {0}")]
    DuplicateAddress(Ipv4Addr),
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], WgConfError> {
    let bytes = STANDARD.decode(b64.trim())?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| WgConfError::InvalidKeyLength(len))
}

/// Public key for a base64 private key.
pub fn derive_public_key(private_key: &str) -> Result<String, WgConfError> {
    let secret = x25519_dalek::StaticSecret::from(decode_key(private_key)?);
    let public = x25519_dalek::PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}

pub fn parse_cidr(s: &str) -> Result<Ipv4Network, WgConfError> {
    s.trim()
        .parse()
        .map_err(|_| WgConfError::CidrParse(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgInterface {
    pub private_key: String,
    /// Hub address with the subnet prefix.
    pub address: Ipv4Network,
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    pub device_id: Option<Uuid>,
    pub public_key: String,
    pub allowed_ip: Ipv4Network,
    pub persistent_keepalive: u16,
}

impl WgPeer {
    pub fn address(&self) -> Ipv4Addr {
        self.allowed_ip.ip()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

impl WgConfig {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", self.interface.private_key);
        let _ = writeln!(out, "Address = {}", self.interface.address);
        let _ = writeln!(out, "ListenPort = {}", self.interface.listen_port);
        for peer in &self.peers {
            out.push('\n');
            if let Some(id) = peer.device_id {
                let _ = writeln!(out, "# device = {id}");
            }
            let _ = writeln!(out, "[Peer]");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ip);
            if peer.persistent_keepalive > 0 {
                let _ = writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive);
            }
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, WgConfError> {
        enum Section {
            None,
            Interface,
            Peer,
        }

        #[derive(Default)]
        struct PeerDraft {
            device_id: Option<Uuid>,
            public_key: Option<String>,
            allowed_ip: Option<Ipv4Network>,
            persistent_keepalive: u16,
        }

        impl PeerDraft {
            fn finish(self) -> Result<WgPeer, WgConfError> {
                Ok(WgPeer {
                    device_id: self.device_id,
                    public_key: self.public_key.ok_or(WgConfError::MissingField("peer PublicKey"))?,
                    allowed_ip: self.allowed_ip.ok_or(WgConfError::MissingField("peer AllowedIPs"))?,
                    persistent_keepalive: self.persistent_keepalive,
                })
            }
        }

        let mut section = Section::None;
        let mut private_key = None;
        let mut address = None;
        let mut listen_port = None;
        let mut peers = Vec::new();
        let mut draft: Option<PeerDraft> = None;
        let mut pending_device: Option<Uuid> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let syntax = |message: String| WgConfError::Syntax {
                line: line_no,
                message,
            };
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                if let Some((k, v)) = comment.split_once('=')
                    && k.trim() == "device"
                {
                    let id = v
                        .trim()
                        .parse()
                        .map_err(|_| syntax(format!("bad device id {:?}", v.trim())))?;
                    pending_device = Some(id);
                }
                continue;
            }

            match line {
                "[Interface]" => {
                    section = Section::Interface;
                    continue;
                }
                "[Peer]" => {
                    if let Some(done) = draft.take() {
                        peers.push(done.finish()?);
                    }
                    draft = Some(PeerDraft {
                        device_id: pending_device.take(),
                        ..Default::default()
                    });
                    section = Section::Peer;
                    continue;
                }
                _ if line.starts_with('[') => {
                    return Err(syntax(format!("unknown section {line}")));
                }
                _ => {}
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| syntax("expected key = value".into()))?;
            let (key, value) = (key.trim().to_ascii_lowercase(), value.trim());

            match section {
                Section::None => return Err(syntax("key outside of a section".into())),
                Section::Interface => match key.as_str() {
                    "privatekey" => private_key = Some(value.to_string()),
                    "address" => address = Some(parse_cidr(value)?),
                    "listenport" => {
                        listen_port = Some(
                            value
                                .parse::<u16>()
                                .map_err(|_| syntax(format!("bad ListenPort {value:?}")))?,
                        )
                    }
                    _ => return Err(syntax(format!("unknown interface key {key}"))),
                },
                Section::Peer => {
                    let Some(peer) = draft.as_mut() else {
                        return Err(syntax("peer key outside of [Peer]".into()));
                    };
                    match key.as_str() {
                        "publickey" => peer.public_key = Some(value.to_string()),
                        "allowedips" => peer.allowed_ip = Some(parse_cidr(value)?),
                        "persistentkeepalive" => {
                            peer.persistent_keepalive = value
                                .parse()
                                .map_err(|_| syntax(format!("bad PersistentKeepalive {value:?}")))?
                        }
                        _ => return Err(syntax(format!("unknown peer key {key}"))),
                    }
                }
            }
        }

        if let Some(done) = draft.take() {
            peers.push(done.finish()?);
        }

        Ok(Self {
            interface: WgInterface {
                private_key: private_key.ok_or(WgConfError::MissingField("interface PrivateKey"))?,
                address: address.ok_or(WgConfError::MissingField("interface Address"))?,
                listen_port: listen_port.ok_or(WgConfError::MissingField("interface ListenPort"))?,
            },
            peers,
        })
    }

    /// Key lengths, host-only allowed-ips inside the hub subnet, unique keys
    /// and unique addresses.
    pub fn validate(&self) -> Result<(), WgConfError> {
        decode_key(&self.interface.private_key)?;
        let subnet = Ipv4Network::new(self.interface.address.network(), self.interface.address.prefix())
            .map_err(|e| WgConfError::CidrParse(e.to_string()))?;

        let mut keys = HashSet::new();
        let mut addresses = HashSet::from([self.interface.address.ip()]);
        for peer in &self.peers {
            decode_key(&peer.public_key)?;
            if peer.allowed_ip.prefix() != 32 {
                return Err(WgConfError::NotHost(peer.allowed_ip));
            }
            if !subnet.contains(peer.address()) {
                return Err(WgConfError::OutsideSubnet(peer.address(), subnet));
            }
            if !keys.insert(peer.public_key.as_str()) {
                return Err(WgConfError::DuplicateKey(peer.public_key.clone()));
            }
            if !addresses.insert(peer.address()) {
                return Err(WgConfError::DuplicateAddress(peer.address()));
            }
        }
        Ok(())
    }
}
