//! Tenant Scheduler (C8): per-tenant admission control so one noisy tenant
//! can't starve the others' step dispatch (§4.8).
//!
//! Each tenant gets its own `tokio::sync::Semaphore` sized to its
//! `max_concurrent_steps` quota; permits are acquired FIFO (the semaphore's
//! own wait queue) before a step is dispatched and released when the step
//! activation (all retries) finishes. A separate semaphore caps concurrent
//! *runs* per tenant the same way. An engine-wide `Semaphore` additionally
//! bounds total in-flight steps across every tenant (§4.8 "Global: an
//! absolute cap on in-flight steps engine-wide") - a step permit is only
//! granted once both the tenant's and the engine's semaphore yield one.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-tenant quota. `max_concurrent_steps` bounds how many step activations
/// may be in flight at once; `max_concurrent_runs` bounds concurrently
/// driven workflow runs.
#[derive(Debug, Clone, Copy)]
pub struct TenantQuota {
    pub max_concurrent_steps: usize,
    pub max_concurrent_runs: usize,
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 16,
            max_concurrent_runs: 4,
        }
    }
}

struct TenantSlots {
    steps: Arc<Semaphore>,
    runs: Arc<Semaphore>,
}

/// A permit on one of a tenant's quota dimensions; dropping it releases the
/// slot back to the scheduler. Step permits additionally hold the
/// engine-wide slot, released in the same drop.
pub struct TenantPermit {
    _permit: OwnedSemaphorePermit,
    _global: Option<OwnedSemaphorePermit>,
}

/// Admission control keyed by tenant id. New tenants get `default_quota`
/// until `set_quota` is called explicitly (§4.8: quotas are per-tenant
/// configuration, not a compile-time constant).
pub struct TenantScheduler {
    default_quota: TenantQuota,
    slots: DashMap<String, TenantSlots>,
    global_steps: Arc<Semaphore>,
}

/// Default engine-wide in-flight step cap when none is configured
/// explicitly - generous enough not to bind in tests, small enough to be a
/// real backstop in a single-process deployment.
const DEFAULT_GLOBAL_STEP_CAP: usize = 1024;

impl TenantScheduler {
    pub fn new(default_quota: TenantQuota) -> Self {
        Self::with_global_cap(default_quota, DEFAULT_GLOBAL_STEP_CAP)
    }

    /// Like [`Self::new`], with an explicit engine-wide cap on concurrently
    /// in-flight steps across every tenant (§4.8 "Global").
    pub fn with_global_cap(default_quota: TenantQuota, global_step_cap: usize) -> Self {
        Self {
            default_quota,
            slots: DashMap::new(),
            global_steps: Arc::new(Semaphore::new(global_step_cap)),
        }
    }

    /// Reconfigure (or set for the first time) a tenant's quota. Takes effect
    /// for subsequent acquisitions; permits already held are unaffected.
    pub fn set_quota(&self, tenant_id: &str, quota: TenantQuota) {
        self.slots.insert(
            tenant_id.to_string(),
            TenantSlots {
                steps: Arc::new(Semaphore::new(quota.max_concurrent_steps)),
                runs: Arc::new(Semaphore::new(quota.max_concurrent_runs)),
            },
        );
    }

    fn slots_for(&self, tenant_id: &str) -> Arc<Semaphore> {
        self.slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantSlots {
                steps: Arc::new(Semaphore::new(self.default_quota.max_concurrent_steps)),
                runs: Arc::new(Semaphore::new(self.default_quota.max_concurrent_runs)),
            })
            .steps
            .clone()
    }

    fn run_slots_for(&self, tenant_id: &str) -> Arc<Semaphore> {
        self.slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantSlots {
                steps: Arc::new(Semaphore::new(self.default_quota.max_concurrent_steps)),
                runs: Arc::new(Semaphore::new(self.default_quota.max_concurrent_runs)),
            })
            .runs
            .clone()
    }

    /// Wait for a step-dispatch slot: the tenant's own semaphore *and* the
    /// engine-wide cap must both yield a permit. Queues FIFO behind other
    /// waiters on the same tenant; never blocks on a *different* tenant's
    /// quota (though it can queue behind the shared global cap).
    pub async fn acquire_step_permit(&self, tenant_id: &str) -> TenantPermit {
        let global = self
            .global_steps
            .clone()
            .acquire_owned()
            .await
            .expect("global semaphore is never closed");
        let sem = self.slots_for(tenant_id);
        let permit = sem.acquire_owned().await.expect("tenant semaphore is never closed");
        TenantPermit {
            _permit: permit,
            _global: Some(global),
        }
    }

    /// Non-blocking variant for admission checks that must not queue (§4.8:
    /// "non-blocking grant|wait admission" at submission time).
    pub fn try_acquire_step_permit(&self, tenant_id: &str) -> Option<TenantPermit> {
        let global = self.global_steps.clone().try_acquire_owned().ok()?;
        let sem = self.slots_for(tenant_id);
        let permit = sem.try_acquire_owned().ok()?;
        Some(TenantPermit {
            _permit: permit,
            _global: Some(global),
        })
    }

    pub async fn acquire_run_permit(&self, tenant_id: &str) -> TenantPermit {
        let sem = self.run_slots_for(tenant_id);
        let permit = sem.acquire_owned().await.expect("tenant semaphore is never closed");
        TenantPermit {
            _permit: permit,
            _global: None,
        }
    }

    pub fn try_acquire_run_permit(&self, tenant_id: &str) -> Option<TenantPermit> {
        let sem = self.run_slots_for(tenant_id);
        sem.try_acquire_owned().ok().map(|permit| TenantPermit {
            _permit: permit,
            _global: None,
        })
    }
}
