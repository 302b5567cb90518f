use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BridgeCore, BridgeError};
use crate::db::{DatabaseError, DatabaseManager, LedgerStore};
use crate::matrix::MatrixEvent;

/// Per-event source of client transaction ids.
///
/// Ids are `{txn_id}.{event_idx}.{seq}`, so re-effecting an event after a
/// failed attempt reuses the ids of the first attempt and the home server
/// collapses the duplicates.
#[derive(Debug)]
pub struct EffectScope {
    txn_id: String,
    event_idx: usize,
    seq: AtomicUsize,
}

impl EffectScope {
    pub fn new(txn_id: &str, event_idx: usize) -> Self {
        Self {
            txn_id: txn_id.to_string(),
            event_idx,
            seq: AtomicUsize::new(0),
        }
    }

    pub fn next_txn_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}.{}", self.txn_id, self.event_idx, seq)
    }
}

/// Applies pushed transactions, committing each event's effects on its own.
pub struct TransactionProcessor {
    core: Arc<BridgeCore>,
    db: DatabaseManager,
    ledger: Arc<dyn LedgerStore>,
    lock: Mutex<()>,
}

impl TransactionProcessor {
    pub fn new(core: Arc<BridgeCore>, db: DatabaseManager) -> Self {
        Self {
            core,
            ledger: db.ledger_store(),
            db,
            lock: Mutex::new(()),
        }
    }

    /// Returns whether every event not committed by an earlier delivery succeeded.
    ///
    /// A homeserver failure fails only its own event; later events still run.
    /// A store failure aborts the transaction and is returned to the caller.
    pub async fn process(&self, txn_id: &str, events: &[Value]) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;

        let committed = self.ledger.committed_event_indices(txn_id).await?;
        info!(
            txn_id = %txn_id,
            events = events.len(),
            committed = committed.len(),
            "received transaction"
        );

        let mut success = true;
        for (event_idx, raw) in events.iter().enumerate() {
            if committed.contains(&event_idx) {
                debug!(txn_id = %txn_id, event_idx, "skipping committed event");
                continue;
            }

            let event = match MatrixEvent::from_value(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(txn_id = %txn_id, event_idx, "ignoring malformed event: {}", e);
                    self.db.begin().await?;
                    self.finish_event(txn_id, event_idx).await?;
                    continue;
                }
            };

            let scope = EffectScope::new(txn_id, event_idx);
            self.db.begin().await?;
            match self.core.handle_event(&event, &scope).await {
                Ok(()) => self.finish_event(txn_id, event_idx).await?,
                Err(BridgeError::Matrix(e)) => {
                    warn!(
                        txn_id = %txn_id,
                        event_idx,
                        event_id = ?event.event_id,
                        event_type = %event.event_type,
                        "event failed, will retry on redelivery: {}",
                        e
                    );
                    self.db.rollback().await?;
                    success = false;
                }
                Err(BridgeError::Database(e)) => {
                    error!(
                        txn_id = %txn_id,
                        event_idx,
                        event_id = ?event.event_id,
                        "store failure while handling event: {}",
                        e
                    );
                    if let Err(rollback) = self.db.rollback().await {
                        error!(txn_id = %txn_id, "rollback failed: {}", rollback);
                    }
                    return Err(e);
                }
            }
        }

        if !success {
            warn!(txn_id = %txn_id, "transaction incomplete");
        }
        Ok(success)
    }

    async fn finish_event(&self, txn_id: &str, event_idx: usize) -> Result<(), DatabaseError> {
        if let Err(e) = self.ledger.mark_event_committed(txn_id, event_idx).await {
            if let Err(rollback) = self.db.rollback().await {
                error!(txn_id = %txn_id, "rollback failed: {}", rollback);
            }
            return Err(e);
        }
        self.db.commit().await
    }
}
