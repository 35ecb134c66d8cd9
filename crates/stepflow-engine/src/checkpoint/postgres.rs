//! PostgreSQL-backed `CheckpointStore` (root decision log: "Postgres as the
//! durable checkpoint backend"). Optimistic concurrency via `checkpoint_seq`,
//! lease ownership via a CAS `UPDATE ... WHERE owning_lease = $expected`,
//! grounded on the teacher's `everruns-durable::persistence::postgres`
//! module's `append_events`/pool-per-store shape.
//!
//! Expected schema (created by the consuming application's migrations,
//! which are out of scope here - see §1 Non-goals):
//!
//! ```sql
//! CREATE TABLE stepflow_runs (
//!     run_id UUID PRIMARY KEY,
//!     tenant_id TEXT NOT NULL,
//!     checkpoint_seq BIGINT NOT NULL DEFAULT 0,
//!     owning_lease TEXT,
//!     lease_expires_at TIMESTAMPTZ
//! );
//! CREATE TABLE stepflow_events (
//!     run_id UUID NOT NULL REFERENCES stepflow_runs(run_id),
//!     seq BIGINT NOT NULL,
//!     ts TIMESTAMPTZ NOT NULL,
//!     payload JSONB NOT NULL,
//!     PRIMARY KEY (run_id, seq)
//! );
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use super::event::{CheckpointEvent, EventKind};
use super::store::{CheckpointError, CheckpointStore, Lease};

#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self))]
    async fn acquire_lease(
        &self,
        run_id: Uuid,
        executor_id: &str,
        ttl: std::time::Duration,
    ) -> Result<Lease, CheckpointError> {
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));

        let updated = sqlx::query(
            r#"
            INSERT INTO stepflow_runs (run_id, tenant_id, checkpoint_seq, owning_lease, lease_expires_at)
            VALUES ($1, 'unknown', 0, $2, $3)
            ON CONFLICT (run_id) DO UPDATE
                SET owning_lease = $2, lease_expires_at = $3
                WHERE stepflow_runs.owning_lease IS NULL
                   OR stepflow_runs.owning_lease = $2
                   OR stepflow_runs.lease_expires_at <= now()
            "#,
        )
        .bind(run_id)
        .bind(executor_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%run_id, error = %e, "acquire_lease failed");
            CheckpointError::Unavailable(e.to_string())
        })?;

        if updated.rows_affected() == 0 {
            let row = sqlx::query("SELECT owning_lease FROM stepflow_runs WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
            let actual: Option<String> = row.and_then(|r| r.get("owning_lease"));
            return Err(CheckpointError::LeaseConflict {
                run_id,
                expected: executor_id.to_string(),
                actual,
            });
        }

        Ok(Lease {
            run_id,
            executor_id: executor_id.to_string(),
            expires_at,
        })
    }

    #[instrument(skip(self, new_events))]
    async fn append(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        executor_id: &str,
        expected_seq: u64,
        new_events: Vec<EventKind>,
    ) -> Result<u64, CheckpointError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT checkpoint_seq, owning_lease FROM stepflow_runs
            WHERE run_id = $1 FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        let (current_seq, owning_lease): (i64, Option<String>) = match row {
            Some(r) => (r.get("checkpoint_seq"), r.get("owning_lease")),
            None => {
                sqlx::query(
                    "INSERT INTO stepflow_runs (run_id, tenant_id, checkpoint_seq, owning_lease) VALUES ($1, $2, 0, $3)",
                )
                .bind(run_id)
                .bind(tenant_id)
                .bind(executor_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
                (0, Some(executor_id.to_string()))
            }
        };

        if let Some(owner) = &owning_lease {
            if owner != executor_id {
                return Err(CheckpointError::LeaseLost(run_id));
            }
        }

        if current_seq as u64 != expected_seq {
            return Err(CheckpointError::SequenceConflict {
                run_id,
                expected: expected_seq,
                actual: current_seq as u64,
            });
        }

        let mut seq = current_seq as u64;
        for kind in new_events {
            seq += 1;
            let payload = serde_json::to_value(&kind)
                .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
            sqlx::query(
                "INSERT INTO stepflow_events (run_id, seq, ts, payload) VALUES ($1, $2, now(), $3)",
            )
            .bind(run_id)
            .bind(seq as i64)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
        }

        // `acquire_lease` may have inserted the row before the real tenant_id
        // was known (it only has `run_id`/`executor_id` to go on); sync it
        // here too so a lease-then-append sequence never leaves the
        // placeholder behind.
        sqlx::query("UPDATE stepflow_runs SET checkpoint_seq = $2, tenant_id = $3 WHERE run_id = $1")
            .bind(run_id)
            .bind(seq as i64)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        Ok(seq)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, CheckpointError> {
        let tenant_row = sqlx::query("SELECT tenant_id FROM stepflow_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))?;
        let tenant_id: String = tenant_row.get("tenant_id");

        let rows = sqlx::query(
            "SELECT seq, ts, payload FROM stepflow_events WHERE run_id = $1 ORDER BY seq ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let ts: chrono::DateTime<chrono::Utc> = row.get("ts");
                let payload: serde_json::Value = row.get("payload");
                let kind: EventKind = serde_json::from_value(payload)
                    .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
                Ok(CheckpointEvent {
                    run_id,
                    tenant_id: tenant_id.clone(),
                    seq: seq as u64,
                    ts,
                    kind,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn expired_non_terminal_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let rows = sqlx::query(
            r#"
            SELECT r.run_id FROM stepflow_runs r
            WHERE (r.lease_expires_at IS NULL OR r.lease_expires_at <= now())
              AND NOT EXISTS (
                  SELECT 1 FROM stepflow_events e
                  WHERE e.run_id = r.run_id AND e.payload->>'kind' = 'run_finished'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.get("run_id")).collect())
    }

    #[instrument(skip(self))]
    async fn list_run_ids(&self, tenant_id: &str) -> Result<Vec<Uuid>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT run_id FROM stepflow_runs WHERE tenant_id = $1 ORDER BY run_id DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.get("run_id")).collect())
    }
}
