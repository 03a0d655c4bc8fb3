//! Postgres store.
//!
//! Claim-state mutations run inside transactions on a shared `PgPool`.
//! Work-ready and permit-extension events are published with `pg_notify`
//! inside the same transaction, so they fire only on commit and reach
//! every listening node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::model::{GroupId, GroupRecord, Permit, PermitRecord, QueueWork, TYPE_NONE, WorkError};
use crate::notify::Notification;

/// Matching claimable rows: unclaimed, under the ceiling, of an accepted
/// type, and either ungrouped or in a started group.
const CLAIMABLE_WHERE: &str = "q.priority <= $1
       AND q.permit = 0
       AND q.name = $2
       AND q.work_type = ANY($3)
       AND (q.group_id IS NULL OR g.started)";

pub struct PgStore {
    pool: PgPool,
    /// pg_notify channel carrying queue notifications.
    channel: String,
}

impl PgStore {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Create the queue tables if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS queue_permit (
                 id         BIGSERIAL PRIMARY KEY,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             );
             CREATE TABLE IF NOT EXISTS queue_group (
                 id        BIGSERIAL PRIMARY KEY,
                 name      TEXT NOT NULL UNIQUE,
                 started   BOOLEAN NOT NULL DEFAULT FALSE,
                 cancelled BOOLEAN NOT NULL DEFAULT FALSE
             );
             CREATE TABLE IF NOT EXISTS queue (
                 id         BIGSERIAL PRIMARY KEY,
                 name       TEXT NOT NULL,
                 priority   BIGINT NOT NULL,
                 permit     BIGINT NOT NULL DEFAULT 0,
                 work_type  BIGINT NOT NULL,
                 address    TEXT UNIQUE,
                 group_id   BIGINT REFERENCES queue_group (id),
                 item       BYTEA NOT NULL,
                 carrier    BYTEA,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             );
             CREATE INDEX IF NOT EXISTS idx_queue_claim
                 ON queue (name, priority, id) WHERE permit = 0;
             CREATE TABLE IF NOT EXISTS queue_failure (
                 address TEXT PRIMARY KEY,
                 error   TEXT NOT NULL
             );",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notify_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        n: &Notification,
    ) -> Result<()> {
        let payload = serde_json::to_string(n)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn types_param(types: &[u64]) -> Vec<i64> {
    if types.is_empty() {
        vec![TYPE_NONE as i64]
    } else {
        types.iter().map(|t| *t as i64).collect()
    }
}

fn require_address(address: &str, operation: &str) -> Result<()> {
    if address.trim().is_empty() {
        tracing::debug!(operation, "rejecting empty address");
        return Err(Error::EmptyAddress);
    }
    Ok(())
}

#[async_trait]
impl super::QueueStore for PgStore {
    async fn push(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO queue (name, priority, work_type, group_id, item, carrier)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(name)
        .bind(priority as i64)
        .bind(work_type as i64)
        .bind(group.map(|g| g.0))
        .bind(payload)
        .bind(carrier)
        .execute(&mut *tx)
        .await?;
        self.notify_tx(&mut tx, &Notification::work_ready()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn push_addressed(
        &self,
        name: &str,
        group: Option<GroupId>,
        priority: u64,
        work_type: u64,
        address: &str,
        payload: &[u8],
        carrier: &[u8],
    ) -> Result<()> {
        require_address(address, "push_addressed")?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO queue (name, priority, work_type, address, group_id, item, carrier)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(name)
        .bind(priority as i64)
        .bind(work_type as i64)
        .bind(address)
        .bind(group.map(|g| g.0))
        .bind(payload)
        .bind(carrier)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                return Err(Error::DuplicateAddress);
            }
            return Err(e.into());
        }

        self.notify_tx(&mut tx, &Notification::work_ready()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pop(&self, name: &str, max_priority: u64, types: &[u64]) -> Result<Option<QueueWork>> {
        let types = types_param(types);

        // Cheap read before paying for a transaction and a permit row.
        // Not a guarantee: a racer may still take the row first.
        let exists_sql = format!(
            "SELECT q.id FROM queue q
             LEFT JOIN queue_group g ON q.group_id = g.id
             WHERE {CLAIMABLE_WHERE}
             LIMIT 1"
        );
        let candidate: Option<(i64,)> = sqlx::query_as(&exists_sql)
            .bind(max_priority as i64)
            .bind(name)
            .bind(&types)
            .fetch_optional(&self.pool)
            .await?;
        if candidate.is_none() {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let (permit_id,): (i64,) =
            sqlx::query_as("INSERT INTO queue_permit DEFAULT VALUES RETURNING id")
                .fetch_one(&mut *tx)
                .await?;

        // FOR UPDATE locks the selected row until commit; the permit = 0
        // re-check inside the CTE stops a second claimer from taking a row
        // that was claimed between the snapshot and the lock.
        let claim_sql = format!(
            "WITH cte AS (
                 SELECT q.id FROM queue q
                 LEFT JOIN queue_group g ON q.group_id = g.id
                 WHERE {CLAIMABLE_WHERE}
                 ORDER BY q.priority ASC, q.id ASC
                 LIMIT 1
                 FOR UPDATE OF q
             )
             UPDATE queue SET permit = $4 FROM cte WHERE queue.id = cte.id"
        );
        sqlx::query(&claim_sql)
            .bind(max_priority as i64)
            .bind(name)
            .bind(&types)
            .bind(permit_id)
            .execute(&mut *tx)
            .await?;

        let row: Option<(Option<String>, i64, Vec<u8>, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT address, work_type, item, carrier FROM queue WHERE permit = $1",
        )
        .bind(permit_id)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            // Lost the race; drop the unused permit with the rollback.
            None => {
                tx.rollback().await?;
                Ok(None)
            }
            Some((address, work_type, payload, carrier)) => {
                tx.commit().await?;
                Ok(Some(QueueWork {
                    permit: Permit(permit_id as u64),
                    address,
                    work_type: work_type as u64,
                    payload,
                    carrier: carrier.unwrap_or_default(),
                }))
            }
        }
    }

    async fn delete(&self, permit: Permit) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue WHERE permit = $1")
            .bind(permit.0 as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue_permit WHERE id = $1")
            .bind(permit.0 as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn permits(&self, name: &str) -> Result<Vec<PermitRecord>> {
        let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT p.id, p.created_at FROM queue_permit p
             INNER JOIN queue q ON q.permit = p.id
             WHERE q.name = $1",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, created_at)| PermitRecord {
                id: Permit(id as u64),
                created_at,
            })
            .collect())
    }

    async fn permit_delete(&self, permit: Permit) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue_permit WHERE id = $1")
            .bind(permit.0 as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE queue SET permit = 0 WHERE permit = $1")
            .bind(permit.0 as i64)
            .execute(&mut *tx)
            .await?;
        self.notify_tx(&mut tx, &Notification::work_ready()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn peek(&self, types: &[u64]) -> Result<Vec<QueueWork>> {
        let types = types_param(types);
        let rows: Vec<(i64, Option<String>, i64, Vec<u8>, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT permit, address, work_type, item, carrier FROM queue
             WHERE work_type = ANY($1)
             ORDER BY id ASC",
        )
        .bind(&types)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(permit, address, work_type, payload, carrier)| QueueWork {
                permit: Permit(permit as u64),
                address,
                work_type: work_type as u64,
                payload,
                carrier: carrier.unwrap_or_default(),
            })
            .collect())
    }

    async fn address_complete(&self, address: &str) -> Result<(bool, Option<WorkError>)> {
        require_address(address, "address_complete")?;
        let live: Option<(i64,)> = sqlx::query_as("SELECT id FROM queue WHERE address = $1 LIMIT 1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        if live.is_some() {
            return Ok((false, None));
        }

        let failure: Option<(String,)> =
            sqlx::query_as("SELECT error FROM queue_failure WHERE address = $1")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        let failure = failure
            .map(|(raw,)| serde_json::from_str::<WorkError>(&raw))
            .transpose()?;
        Ok((true, failure))
    }

    async fn address_in_progress(&self, address: &str) -> Result<bool> {
        require_address(address, "address_in_progress")?;
        let live: Option<(i64,)> = sqlx::query_as("SELECT id FROM queue WHERE address = $1 LIMIT 1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(live.is_some())
    }

    async fn record_address_failure(
        &self,
        address: &str,
        failure: Option<WorkError>,
    ) -> Result<()> {
        match failure {
            Some(we) => {
                let raw = serde_json::to_string(&we)?;
                sqlx::query(
                    "INSERT INTO queue_failure (address, error) VALUES ($1, $2)
                     ON CONFLICT (address) DO UPDATE SET error = EXCLUDED.error",
                )
                .bind(address)
                .bind(raw)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM queue_failure WHERE address = $1")
                    .bind(address)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn notify_extend(&self, permit: Permit) -> Result<()> {
        let payload = serde_json::to_string(&Notification::permit_extended(permit.0))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl super::GroupStore for PgStore {
    async fn group_create(&self, name: &str) -> Result<GroupRecord> {
        let (id,): (i64,) = sqlx::query_as("INSERT INTO queue_group (name) VALUES ($1) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(GroupRecord {
            id: GroupId(id),
            name: name.to_string(),
            started: false,
            cancelled: false,
        })
    }

    async fn group_start(&self, id: GroupId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE queue_group SET started = TRUE WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("group {id}")));
        }
        self.notify_tx(&mut tx, &Notification::work_ready()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn group_complete(&self, id: GroupId) -> Result<(bool, bool)> {
        let mut tx = self.pool.begin().await?;
        let (remaining,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM queue WHERE group_id = $1")
                .bind(id.0)
                .fetch_one(&mut *tx)
                .await?;
        if remaining > 0 {
            tx.rollback().await?;
            return Ok((false, false));
        }

        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancelled FROM queue_group WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let (cancelled,) = row.ok_or_else(|| Error::NotFound(format!("group {id}")))?;

        sqlx::query("DELETE FROM queue_group WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((true, cancelled))
    }

    async fn group_cancel(&self, id: GroupId) -> Result<()> {
        let updated = sqlx::query("UPDATE queue_group SET cancelled = TRUE WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("group {id}")));
        }
        Ok(())
    }

    async fn group_clear(&self, id: GroupId) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE group_id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
