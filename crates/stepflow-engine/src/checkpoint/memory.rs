//! In-memory `CheckpointStore`, used in tests and single-process embedding
//! (root decision log: "in-memory store for tests and single-process
//! embedding"). Grounded on the teacher's `dashmap`-backed concurrent maps.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::event::{CheckpointEvent, EventKind};
use super::store::{CheckpointError, CheckpointStore, Lease};

struct RunLog {
    tenant_id: String,
    events: parking_lot::Mutex<Vec<CheckpointEvent>>,
    seq: AtomicU64,
    lease: parking_lot::Mutex<Option<Lease>>,
}

/// A process-local, non-durable-across-restart checkpoint store. Suitable
/// for tests and for embedding the engine in a single process where crash
/// recovery across restarts isn't required.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<Uuid, RunLog>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_entry(&self, run_id: Uuid, tenant_id: &str) -> dashmap::mapref::one::Ref<'_, Uuid, RunLog> {
        self.runs.entry(run_id).or_insert_with(|| RunLog {
            tenant_id: tenant_id.to_string(),
            events: parking_lot::Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            lease: parking_lot::Mutex::new(None),
        });
        self.runs.get(&run_id).unwrap()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn acquire_lease(
        &self,
        run_id: Uuid,
        executor_id: &str,
        ttl: std::time::Duration,
    ) -> Result<Lease, CheckpointError> {
        let run = self.run_entry(run_id, "unknown");
        let now = chrono::Utc::now();
        let mut lease_slot = run.lease.lock();

        if let Some(existing) = lease_slot.as_ref() {
            if existing.executor_id != executor_id && existing.expires_at > now {
                return Err(CheckpointError::LeaseConflict {
                    run_id,
                    expected: executor_id.to_string(),
                    actual: Some(existing.executor_id.clone()),
                });
            }
        }

        let lease = Lease {
            run_id,
            executor_id: executor_id.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
        };
        *lease_slot = Some(lease.clone());
        Ok(lease)
    }

    async fn append(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        executor_id: &str,
        expected_seq: u64,
        new_events: Vec<EventKind>,
    ) -> Result<u64, CheckpointError> {
        let run = self.run_entry(run_id, tenant_id);

        {
            let lease_slot = run.lease.lock();
            if let Some(existing) = lease_slot.as_ref() {
                if existing.executor_id != executor_id && existing.expires_at > chrono::Utc::now() {
                    return Err(CheckpointError::LeaseConflict {
                        run_id,
                        expected: executor_id.to_string(),
                        actual: Some(existing.executor_id.clone()),
                    });
                }
            }
        }

        let mut events = run.events.lock();
        let current_seq = run.seq.load(Ordering::SeqCst);
        if current_seq != expected_seq {
            return Err(CheckpointError::SequenceConflict {
                run_id,
                expected: expected_seq,
                actual: current_seq,
            });
        }

        let mut seq = current_seq;
        for kind in new_events {
            seq += 1;
            events.push(CheckpointEvent {
                run_id,
                tenant_id: run.tenant_id.clone(),
                seq,
                ts: chrono::Utc::now(),
                kind,
            });
        }
        run.seq.store(seq, Ordering::SeqCst);
        Ok(seq)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, CheckpointError> {
        let run = self
            .runs
            .get(&run_id)
            .ok_or(CheckpointError::RunNotFound(run_id))?;
        Ok(run.events.lock().clone())
    }

    async fn expired_non_terminal_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let now = chrono::Utc::now();
        let mut out = Vec::new();
        for entry in self.runs.iter() {
            let expired = entry
                .lease
                .lock()
                .as_ref()
                .map(|l| l.expires_at <= now)
                .unwrap_or(true);
            if !expired {
                continue;
            }
            let events = entry.events.lock();
            let terminal = events
                .iter()
                .any(|e| matches!(e.kind, EventKind::RunFinished { .. }));
            if !terminal {
                out.push(*entry.key());
            }
        }
        Ok(out)
    }

    async fn list_run_ids(&self, tenant_id: &str) -> Result<Vec<Uuid>, CheckpointError> {
        let mut out: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = self
            .runs
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .filter_map(|entry| {
                entry
                    .events
                    .lock()
                    .first()
                    .map(|first| (first.ts, *entry.key()))
            })
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(out.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::event::EventKind;

    #[tokio::test]
    async fn append_assigns_monotone_sequence_numbers() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let seq = store
            .append(run_id, "t1", "exec-a", 0, vec![EventKind::RunStarted])
            .await
            .unwrap();
        assert_eq!(seq, 1);
        let seq = store
            .append(run_id, "t1", "exec-a", 1, vec![EventKind::StepReady { step_id: "a".into() }])
            .await
            .unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn append_with_stale_expected_seq_is_rejected() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        store
            .append(run_id, "t1", "exec-a", 0, vec![EventKind::RunStarted])
            .await
            .unwrap();
        let err = store
            .append(run_id, "t1", "exec-a", 0, vec![EventKind::RunStarted])
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::SequenceConflict { .. }));
    }

    #[tokio::test]
    async fn second_writer_is_rejected_while_lease_is_held() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        store
            .acquire_lease(run_id, "exec-a", std::time::Duration::from_secs(30))
            .await
            .unwrap();

        let err = store
            .append(run_id, "t1", "exec-b", 0, vec![EventKind::RunStarted])
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::LeaseConflict { .. }));
    }

    #[tokio::test]
    async fn load_events_returns_full_ordered_log() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        store
            .append(
                run_id,
                "t1",
                "exec-a",
                0,
                vec![EventKind::RunStarted, EventKind::StepReady { step_id: "a".into() }],
            )
            .await
            .unwrap();
        let events = store.load_events(run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }
}
