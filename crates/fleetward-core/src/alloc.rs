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

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use ipnetwork::Ipv4Network;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{AddressClaim, DeviceStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no free tunnel addresses left in {0}")]
    SubnetExhausted(Ipv4Network),

    #[error("device not found")]
    DeviceNotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lowest host address in `subnet` not present in `used`.
///
/// The network address, the broadcast address and the first host (the hub)
/// are never handed out.
pub fn lowest_free_host(
    subnet: Ipv4Network,
    used: impl IntoIterator<Item = Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let base = u32::from(subnet.network());
    let size = 1u64 << (32 - u32::from(subnet.prefix()));
    if size < 4 {
        return None;
    }
    let used: BTreeSet<u32> = used
        .into_iter()
        .filter(|ip| subnet.contains(*ip))
        .map(|ip| u32::from(ip) - base)
        .collect();

    // offset 1 is the hub, size - 1 is broadcast
    let mut candidate = 2u32;
    for offset in used.range(2..) {
        if *offset != candidate {
            break;
        }
        candidate += 1;
    }

    if u64::from(candidate) >= size - 1 {
        return None;
    }
    Some(Ipv4Addr::from(base + candidate))
}

/// Lowest port in `range` not present in `used`.
pub fn lowest_free_port(
    range: &RangeInclusive<u16>,
    used: impl IntoIterator<Item = u16>,
) -> Option<u16> {
    let used: BTreeSet<u16> = used.into_iter().collect();
    range.clone().find(|port| !used.contains(port))
}

/// Assign a tunnel address to `device_id`, reusing the existing one if the
/// device already has it. The store performs the scan and the write in one
/// transaction.
#[tracing::instrument(skip(store))]
pub async fn allocate_address<S: DeviceStore>(
    store: &S,
    device_id: Uuid,
    subnet: Ipv4Network,
) -> Result<Ipv4Addr, AllocError> {
    match store.claim_lowest_address(device_id, subnet).await? {
        AddressClaim::Claimed(address) => {
            info!(%device_id, %address, "allocated tunnel address");
            Ok(address)
        }
        AddressClaim::Existing(address) => Ok(address),
        AddressClaim::Exhausted => {
            warn!(%device_id, %subnet, "tunnel subnet exhausted");
            Err(AllocError::SubnetExhausted(subnet))
        }
        AddressClaim::NotFound => Err(AllocError::DeviceNotFound),
    }
}
