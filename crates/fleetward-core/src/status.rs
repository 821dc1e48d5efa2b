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

//! Device connectivity state machine.
//!
//! ```text
//! pending ──success──▶ online ◀──success── offline
//!                        │                    ▲
//!                        └─failure + stale────┘
//! ```
//!
//! A failure on a device that was seen recently leaves its status alone so a
//! single dropped probe does not flap it offline.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleetward_types::{DeviceStatus, ResourceSnapshot};

use crate::db::Device;

/// What a probe attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Alive(ResourceSnapshot),
    /// Timeout, refused connection, bad response. Worth retrying.
    Recoverable(String),
    /// The device cannot be probed as configured (e.g. its stored
    /// credentials do not decrypt). Retrying will not help.
    Fatal(String),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Alive(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Alive(_) => None,
            Self::Recoverable(e) | Self::Fatal(e) => Some(e),
        }
    }
}

/// Fields written back to the device row after a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub resources: Option<ResourceSnapshot>,
    pub last_error: Option<String>,
}

pub fn is_stale(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
    match last_seen {
        Some(seen) => now.signed_duration_since(seen) > threshold,
        None => true,
    }
}

pub fn transition(
    device: &Device,
    outcome: &ProbeOutcome,
    now: DateTime<Utc>,
    staleness: Duration,
) -> StatusUpdate {
    let status = match (outcome, device.status) {
        (ProbeOutcome::Alive(_), _) => DeviceStatus::Online,
        // pending until the first success
        (_, DeviceStatus::Pending) => DeviceStatus::Pending,
        (ProbeOutcome::Fatal(_), _) => DeviceStatus::Offline,
        (ProbeOutcome::Recoverable(_), current) => {
            if is_stale(device.last_seen, now, staleness) {
                DeviceStatus::Offline
            } else {
                current
            }
        }
    };

    match outcome {
        ProbeOutcome::Alive(snapshot) => StatusUpdate {
            status,
            last_seen: Some(now),
            resources: Some(*snapshot),
            last_error: None,
        },
        ProbeOutcome::Recoverable(e) | ProbeOutcome::Fatal(e) => StatusUpdate {
            status,
            last_seen: device.last_seen,
            resources: device.resources,
            last_error: Some(e.clone()),
        },
    }
}
