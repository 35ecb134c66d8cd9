//! Engine-wide configuration (SPEC_FULL §1 "Configuration contract").
//!
//! Tunables that live outside any single `WorkflowDef` - the global
//! concurrency cap, default grace period, lease TTL, checkpoint backend
//! selection - are grouped here rather than threaded through call sites
//! individually, loaded either programmatically (`EngineConfig::new`, for
//! tests and embedding) or from the environment (`from_env`), in the style
//! of the teacher's `everruns-observability::config::ObservabilityConfig`.
//! The engine itself never reads the environment directly; only this
//! module does, and only when asked to.

use std::env;
use std::time::Duration;

use crate::tenant::TenantQuota;

/// Which `CheckpointStore` implementation a built `Engine` should use.
/// `Postgres` is only constructible behind the `postgres` feature, since it
/// requires an `sqlx::PgPool` the caller must have already connected.
#[derive(Debug, Clone)]
pub enum CheckpointBackend {
    InMemory,
    #[cfg(feature = "postgres")]
    Postgres { database_url: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Opaque identity for this process's lease ownership (hostname+pid, or
    /// a per-process UUID) - see [`crate::executor::RunConfig::executor_id`].
    pub executor_id: String,
    /// How long a run's lease is held before it must be renewed.
    pub lease_ttl: Duration,
    /// How long an in-flight step is given to unwind after cancellation
    /// before being abandoned (§4.6, default 2s).
    pub grace_period: Duration,
    /// Absolute cap on in-flight steps across every tenant (§4.8 "Global").
    pub global_step_cap: usize,
    /// Quota newly-seen tenants get until `TenantScheduler::set_quota` is
    /// called explicitly for them.
    pub default_tenant_quota: TenantQuota,
    pub checkpoint_backend: CheckpointBackend,
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ms),
    )
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl EngineConfig {
    /// Construct with every field explicit - the path tests and in-process
    /// embedding should use.
    pub fn new(executor_id: impl Into<String>, checkpoint_backend: CheckpointBackend) -> Self {
        Self {
            executor_id: executor_id.into(),
            lease_ttl: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
            global_step_cap: 1024,
            default_tenant_quota: TenantQuota::default(),
            checkpoint_backend,
        }
    }

    /// Load from the environment (optionally via a `.env` file, dotenvy-style).
    ///
    /// Environment variables:
    /// - `STEPFLOW_EXECUTOR_ID`: this process's lease-owner identity (default: a fresh UUID)
    /// - `STEPFLOW_LEASE_TTL_MS`: lease TTL in milliseconds (default: 30000)
    /// - `STEPFLOW_GRACE_PERIOD_MS`: cancellation grace period in milliseconds (default: 2000)
    /// - `STEPFLOW_GLOBAL_STEP_CAP`: engine-wide in-flight step cap (default: 1024)
    /// - `STEPFLOW_TENANT_MAX_CONCURRENT_STEPS` / `STEPFLOW_TENANT_MAX_CONCURRENT_RUNS`: default per-tenant quota
    /// - `DATABASE_URL`: if set and the `postgres` feature is enabled, selects the Postgres checkpoint backend;
    ///   otherwise the in-memory backend is used.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let executor_id = env::var("STEPFLOW_EXECUTOR_ID")
            .unwrap_or_else(|_| format!("stepflow-engine-{}", uuid::Uuid::new_v4()));

        #[cfg(feature = "postgres")]
        let checkpoint_backend = match env::var("DATABASE_URL") {
            Ok(database_url) if !database_url.is_empty() => CheckpointBackend::Postgres { database_url },
            _ => CheckpointBackend::InMemory,
        };
        #[cfg(not(feature = "postgres"))]
        let checkpoint_backend = CheckpointBackend::InMemory;

        Self {
            executor_id,
            lease_ttl: env_duration_ms("STEPFLOW_LEASE_TTL_MS", 30_000),
            grace_period: env_duration_ms("STEPFLOW_GRACE_PERIOD_MS", 2_000),
            global_step_cap: env_usize("STEPFLOW_GLOBAL_STEP_CAP", 1024),
            default_tenant_quota: TenantQuota {
                max_concurrent_steps: env_usize("STEPFLOW_TENANT_MAX_CONCURRENT_STEPS", 16),
                max_concurrent_runs: env_usize("STEPFLOW_TENANT_MAX_CONCURRENT_RUNS", 4),
            },
            checkpoint_backend,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(format!("stepflow-engine-{}", uuid::Uuid::new_v4()), CheckpointBackend::InMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_in_memory_backend_and_sane_tunables() {
        let config = EngineConfig::default();
        assert!(matches!(config.checkpoint_backend, CheckpointBackend::InMemory));
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert_eq!(config.global_step_cap, 1024);
    }

    #[test]
    fn explicit_construction_round_trips_the_backend_choice() {
        let config = EngineConfig::new("exec-1", CheckpointBackend::InMemory);
        assert_eq!(config.executor_id, "exec-1");
    }
}
