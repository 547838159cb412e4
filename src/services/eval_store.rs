//! Per-invocation evaluation state and its process-wide registry.
//!
//! An `EvalState` is the controller's own coordination record for one live
//! invocation: the append-only evaluation history, the tracing span rooted
//! at the source event, and the exclusive-access token that serializes
//! evaluations. The `EvalStore` maps invocation ids to these states and is
//! the single shared mutable structure in the controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::Span;
use uuid::Uuid;

use crate::domain::models::EvalRecord;

/// Exclusive-access token for one evaluation.
///
/// Dropping the guard releases the token. Holders must not carry it across
/// an entire notification cycle; evaluations acquire, run, and release.
pub type EvalGuard = OwnedMutexGuard<()>;

/// Coordination record for one live invocation.
pub struct EvalState {
    invocation_id: Uuid,
    /// Span rooted at the event that created this state; evaluations are
    /// recorded as its children.
    span: Span,
    token: Arc<Mutex<()>>,
    records: RwLock<Vec<EvalRecord>>,
    finished: AtomicBool,
    finish_reason: RwLock<Option<String>>,
    created_at: DateTime<Utc>,
}

impl EvalState {
    pub fn new(invocation_id: Uuid, span: Span) -> Self {
        Self {
            invocation_id,
            span,
            token: Arc::new(Mutex::new(())),
            records: RwLock::new(Vec::new()),
            finished: AtomicBool::new(false),
            finish_reason: RwLock::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Non-blocking acquisition of the evaluation token.
    ///
    /// Contenders that lose MUST NOT wait: they abandon the attempt and
    /// rely on re-enqueueing. Skip, don't queue.
    pub fn try_acquire(&self) -> Option<EvalGuard> {
        self.token.clone().try_lock_owned().ok()
    }

    /// Append a record to the history.
    pub async fn record(&self, record: EvalRecord) {
        self.records.write().await.push(record);
    }

    /// The most recent record, if any. The sweeper derives staleness from
    /// its timestamp.
    pub async fn last(&self) -> Option<EvalRecord> {
        self.records.read().await.last().cloned()
    }

    /// Snapshot of the full history.
    pub async fn history(&self) -> Vec<EvalRecord> {
        self.records.read().await.clone()
    }

    /// Number of error-outcome records in the history.
    pub async fn error_count(&self) -> u32 {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.outcome.is_error())
            .count() as u32
    }

    /// Cause of the most recent error record, if any.
    pub async fn last_error(&self) -> Option<String> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.outcome.is_error())
            .and_then(|r| r.cause.clone())
    }

    /// Mark the state terminal. Idempotent; the first call wins and appends
    /// the final record.
    pub async fn finish(&self, success: bool, reason: impl Into<String>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        *self.finish_reason.write().await = Some(reason.clone());
        self.record(EvalRecord::finished(success, reason)).await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub async fn finish_reason(&self) -> Option<String> {
        self.finish_reason.read().await.clone()
    }
}

/// Process-wide registry of evaluation states.
///
/// Rebuilt from the invocation cache after a restart; nothing in here is
/// durable.
#[derive(Default)]
pub struct EvalStore {
    states: RwLock<HashMap<Uuid, Arc<EvalState>>>,
}

impl EvalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the state for an invocation.
    pub async fn load(&self, id: Uuid) -> Option<Arc<EvalState>> {
        self.states.read().await.get(&id).cloned()
    }

    /// Atomic create-on-miss: two concurrent creators of the same id see
    /// the same resulting state.
    pub async fn load_or_store(&self, id: Uuid, span: Span) -> Arc<EvalState> {
        let mut states = self.states.write().await;
        states
            .entry(id)
            .or_insert_with(|| Arc::new(EvalState::new(id, span)))
            .clone()
    }

    /// Remove the state for an invocation. Returns whether it existed.
    pub async fn delete(&self, id: Uuid) -> bool {
        self.states.write().await.remove(&id).is_some()
    }

    /// Snapshot of all live states, in no particular order.
    pub async fn list(&self) -> Vec<Arc<EvalState>> {
        self.states.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    /// Drop every state, finishing live ones with reason "shutdown".
    pub async fn close(&self) {
        let states: Vec<Arc<EvalState>> = {
            let mut map = self.states.write().await;
            map.drain().map(|(_, state)| state).collect()
        };
        for state in states {
            if !state.is_finished() {
                state.finish(false, "shutdown").await;
            }
        }
    }
}
