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

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use fleetward_types::{ResourceSnapshot, SubscriberView};
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    AccountingLedger, AddressClaim, Device, DeviceStore, Result, SessionRow, SessionStore,
    StoreError,
};
use crate::alloc::lowest_free_host;
use crate::credentials::SealedSecret;
use crate::sessions::{AccountingRecord, ObservedSession, classify_accounting};
use crate::status::StatusUpdate;

/// Advisory lock key serializing tunnel address claims.
const ADDRESS_LOCK: i64 = 0x666c_6565_7477_6431;

const DEVICE_COLUMNS: &str = "id, name, tunnel_address, public_key, api_username, \
     api_password_enc, api_password_nonce, api_port, console_port, public_port, status, \
     last_seen, cpu_percent, memory_percent, uptime_secs, last_error, callback_token, \
     reported_address, last_heartbeat, created_at";

const SESSION_COLUMNS: &str = "id, device_id, identity, peer_address, mac_address, kind, \
     accounting_id, status, first_seen, last_seen, ended_at";

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: Uuid,
    name: String,
    tunnel_address: Option<IpNetwork>,
    public_key: Option<String>,
    api_username: String,
    api_password_enc: Vec<u8>,
    api_password_nonce: Vec<u8>,
    api_port: i32,
    console_port: i32,
    public_port: Option<i32>,
    status: String,
    last_seen: Option<DateTime<Utc>>,
    cpu_percent: Option<f64>,
    memory_percent: Option<f64>,
    uptime_secs: Option<i64>,
    last_error: Option<String>,
    callback_token: Option<String>,
    reported_address: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

fn port(id: Uuid, column: &str, value: i32) -> Result<u16> {
    u16::try_from(value).map_err(|_| StoreError::Corrupt(format!("device {id}: {column} = {value}")))
}

fn ipv4(network: IpNetwork) -> Result<Ipv4Addr> {
    match network.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(StoreError::Corrupt(format!("expected IPv4 address, got {ip}"))),
    }
}

fn inet(ip: Ipv4Addr) -> IpNetwork {
    IpNetwork::V4(Ipv4Network::from(ip))
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let resources = match (row.cpu_percent, row.memory_percent, row.uptime_secs) {
            (Some(cpu), Some(memory), Some(uptime)) => Some(ResourceSnapshot {
                cpu_percent: cpu,
                memory_percent: memory,
                uptime_secs: uptime.max(0) as u64,
            }),
            _ => None,
        };
        Ok(Device {
            id: row.id,
            name: row.name,
            tunnel_address: row.tunnel_address.map(ipv4).transpose()?,
            public_key: row.public_key,
            api_username: row.api_username,
            api_password: SealedSecret {
                ciphertext: row.api_password_enc,
                nonce: row.api_password_nonce,
            },
            api_port: port(row.id, "api_port", row.api_port)?,
            console_port: port(row.id, "console_port", row.console_port)?,
            public_port: row
                .public_port
                .map(|p| port(row.id, "public_port", p))
                .transpose()?,
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("device {}: {e}", row.id)))?,
            last_seen: row.last_seen,
            resources,
            last_error: row.last_error,
            callback_token: row.callback_token,
            reported_address: row.reported_address,
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionDbRow {
    id: Uuid,
    device_id: Uuid,
    identity: String,
    peer_address: String,
    mac_address: Option<String>,
    kind: String,
    accounting_id: Option<String>,
    status: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionDbRow> for SessionRow {
    type Error = StoreError;

    fn try_from(row: SessionDbRow) -> Result<Self> {
        let corrupt = |e: fleetward_types::UnknownVariant| {
            StoreError::Corrupt(format!("session {}: {e}", row.id))
        };
        Ok(SessionRow {
            id: row.id,
            device_id: row.device_id,
            kind: row.kind.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            identity: row.identity,
            peer_address: row.peer_address,
            mac_address: row.mac_address,
            accounting_id: row.accounting_id,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            ended_at: row.ended_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RadacctRow {
    acctsessionid: String,
    username: String,
    nasipaddress: IpNetwork,
    framedipaddress: Option<IpNetwork>,
    callingstationid: Option<String>,
    nasporttype: Option<String>,
    framedprotocol: Option<String>,
    servicetype: Option<String>,
    updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(e: &sqlx::Error, constraint: &str) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

impl DeviceStore for PgStore {
    #[tracing::instrument(skip(self))]
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE deleted_at IS NULL ORDER BY created_at"
        );
        sqlx::query_as::<_, DeviceRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Device::try_from)
            .collect()
    }

    #[tracing::instrument(skip(self))]
    async fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE deleted_at IS NULL AND id = $1");
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    #[tracing::instrument(skip_all)]
    async fn get_device_by_token(&self, token: &str) -> Result<Option<Device>> {
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE deleted_at IS NULL AND callback_token = $1"
        );
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    #[tracing::instrument(skip(self))]
    async fn claim_lowest_address(&self, id: Uuid, subnet: Ipv4Network) -> Result<AddressClaim> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADDRESS_LOCK)
            .execute(&mut *tx)
            .await?;

        let current: Option<(Option<IpNetwork>,)> = sqlx::query_as(
            "SELECT tunnel_address FROM devices WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Ok(AddressClaim::NotFound);
        };
        if let Some(existing) = current {
            return Ok(AddressClaim::Existing(ipv4(existing)?));
        }

        let used: Vec<(IpNetwork,)> = sqlx::query_as(
            "SELECT tunnel_address FROM devices
             WHERE deleted_at IS NULL AND tunnel_address IS NOT NULL",
        )
        .fetch_all(&mut *tx)
        .await?;
        let used = used.into_iter().filter_map(|(n,)| ipv4(n).ok());
        let Some(address) = lowest_free_host(subnet, used) else {
            return Ok(AddressClaim::Exhausted);
        };

        sqlx::query("UPDATE devices SET tunnel_address = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(inet(address))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(%id, %address, "claimed tunnel address");
        Ok(AddressClaim::Claimed(address))
    }

    #[tracing::instrument(skip(self))]
    async fn claim_address(&self, id: Uuid, address: Ipv4Addr) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADDRESS_LOCK)
            .execute(&mut *tx)
            .await?;

        let current: Option<(Option<IpNetwork>,)> = sqlx::query_as(
            "SELECT tunnel_address FROM devices WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Ok(false);
        };
        if let Some(existing) = current {
            return Ok(ipv4(existing)? == address);
        }

        let result = sqlx::query(
            "UPDATE devices SET tunnel_address = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(inet(address))
        .execute(&mut *tx)
        .await;
        match result {
            Ok(_) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(e) if is_unique_violation(&e, "devices_tunnel_address_live_key") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, key))]
    async fn set_public_key(&self, id: Uuid, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        // a key that moved to another device leaves its old owner
        sqlx::query(
            "UPDATE devices SET public_key = NULL, updated_at = now()
             WHERE public_key = $2 AND id <> $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(key)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE devices SET public_key = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, token))]
    async fn set_callback_token(&self, id: Uuid, token: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET callback_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_error(&self, id: Uuid, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE devices SET last_error = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_status(&self, id: Uuid, update: &StatusUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE devices
             SET status = $2, last_seen = $3, cpu_percent = $4, memory_percent = $5,
                 uptime_secs = $6, last_error = $7, updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.last_seen)
        .bind(update.resources.map(|r| r.cpu_percent))
        .bind(update.resources.map(|r| r.memory_percent))
        .bind(update.resources.map(|r| r.uptime_secs.min(i64::MAX as u64) as i64))
        .bind(update.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        reported_address: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET reported_address = $2, last_heartbeat = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(reported_address)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn used_public_ports(&self) -> Result<Vec<u16>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT public_port FROM devices
             WHERE deleted_at IS NULL AND public_port IS NOT NULL
             ORDER BY public_port",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(p,)| u16::try_from(p).ok())
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn assign_public_port(&self, id: Uuid, port: u16) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET public_port = $2, updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL AND (public_port IS NULL OR public_port = $2)",
        )
        .bind(id)
        .bind(i32::from(port))
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e, "devices_public_port_live_key") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_public_port(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE devices SET public_port = NULL, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE devices SET deleted_at = now(), updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }
}

impl SessionStore for PgStore {
    async fn active_sessions(&self) -> Result<Vec<SessionRow>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'active'");
        sqlx::query_as::<_, SessionDbRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SessionRow::try_from)
            .collect()
    }

    #[tracing::instrument(skip_all, fields(count = sessions.len()))]
    async fn upsert_active(&self, sessions: &[ObservedSession], seen_at: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for observed in sessions {
            sqlx::query(
                "INSERT INTO sessions
                     (device_id, identity, peer_address, mac_address, kind, accounting_id,
                      status, first_seen, last_seen)
                 VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $7)
                 ON CONFLICT (device_id, identity, peer_address) WHERE status = 'active'
                 DO UPDATE SET
                     last_seen = EXCLUDED.last_seen,
                     kind = EXCLUDED.kind,
                     mac_address = COALESCE(EXCLUDED.mac_address, sessions.mac_address),
                     accounting_id = COALESCE(EXCLUDED.accounting_id, sessions.accounting_id)",
            )
            .bind(observed.key.device_id)
            .bind(&observed.key.identity)
            .bind(&observed.key.peer_address)
            .bind(observed.mac_address.as_deref())
            .bind(observed.kind.as_str())
            .bind(observed.accounting_id.as_deref())
            .bind(seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(sessions.len())
    }

    async fn disconnect(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let done = sqlx::query(
            "UPDATE sessions SET status = 'disconnected', ended_at = $2
             WHERE id = ANY($1) AND status = 'active'",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() as usize)
    }

    async fn refresh_subscriber_flags(&self, identities: &[String]) -> Result<usize> {
        if identities.is_empty() {
            return Ok(0);
        }
        let done = sqlx::query(
            "UPDATE subscribers s
             SET online = EXISTS (
                     SELECT 1 FROM sessions x
                     WHERE x.identity = s.username AND x.status = 'active'),
                 updated_at = now()
             WHERE s.username = ANY($1)",
        )
        .bind(identities)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() as usize)
    }

    async fn force_all_offline(&self) -> Result<usize> {
        let done = sqlx::query("UPDATE subscribers SET online = false, updated_at = now() WHERE online")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() as usize)
    }

    async fn count_active(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn record_orphans(&self, records: &[AccountingRecord], at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO accounting_orphans
                     (acctsessionid, username, nasipaddress, framedipaddress, seen_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&record.session_id)
            .bind(&record.username)
            .bind(inet(record.nas_address))
            .bind(record.framed_address.as_deref())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn subscriber(&self, identity: &str) -> Result<Option<SubscriberView>> {
        let flag: Option<(bool,)> = sqlx::query_as("SELECT online FROM subscribers WHERE username = $1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        let Some((online,)) = flag else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE identity = $1 AND status = 'active' ORDER BY first_seen"
        );
        let sessions = sqlx::query_as::<_, SessionDbRow>(&sql)
            .bind(identity)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| SessionRow::try_from(row).map(|s| s.view()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(SubscriberView {
            identity: identity.to_string(),
            online,
            sessions,
        }))
    }
}

impl AccountingLedger for PgStore {
    #[tracing::instrument(skip(self))]
    async fn open_records(&self, since: DateTime<Utc>) -> Result<Vec<AccountingRecord>> {
        let rows: Vec<RadacctRow> = sqlx::query_as(
            "SELECT acctsessionid, username, nasipaddress, framedipaddress, callingstationid,
                    nasporttype, framedprotocol, servicetype,
                    COALESCE(acctupdatetime, acctstarttime) AS updated_at
             FROM radacct
             WHERE acctstoptime IS NULL
               AND username IS NOT NULL
               AND COALESCE(acctupdatetime, acctstarttime) >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let nas_address = match ipv4(row.nasipaddress) {
                Ok(ip) => ip,
                Err(_) => {
                    warn!(session_id = %row.acctsessionid, "skipping accounting row with non-IPv4 NAS");
                    continue;
                }
            };
            records.push(AccountingRecord {
                kind: classify_accounting(
                    row.nasporttype.as_deref(),
                    row.framedprotocol.as_deref(),
                    row.servicetype.as_deref(),
                ),
                session_id: row.acctsessionid,
                username: row.username,
                nas_address,
                framed_address: row.framedipaddress.map(|n| n.ip().to_string()),
                calling_station: row.callingstationid,
                updated_at: row.updated_at,
            });
        }
        Ok(records)
    }
}
