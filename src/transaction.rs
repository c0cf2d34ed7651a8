use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DbError, Result};

#[derive(Debug, Clone)]
pub enum PendingOp {
    Insert {
        collection: String,
        record: Value,
    },
    Update {
        collection: String,
        filter: Value,
        changes: Value,
    },
    Delete {
        collection: String,
        filter: Value,
    },
}

impl PendingOp {
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: TxStatus,
    pub operations: Vec<PendingOp>,
    /// Collection → on-disk records captured before the transaction's first
    /// operation against it. Rollback rewrites exactly these.
    pub snapshots: BTreeMap<String, Vec<Value>>,
}

/// Tracks pending transactions by id. Replay and rollback are driven by the
/// engine, which owns storage; this manager only owns the transaction state.
pub struct TransactionManager {
    active: Mutex<HashMap<Uuid, Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.active.lock().insert(
            id,
            Transaction {
                id,
                started_at: Utc::now(),
                status: TxStatus::Pending,
                operations: Vec::new(),
                snapshots: BTreeMap::new(),
            },
        );
        id
    }

    /// Appends an operation; `snapshot` is invoked only when this is the
    /// transaction's first touch of the operation's collection.
    pub fn record<F>(&self, id: Uuid, op: PendingOp, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<Value>>,
    {
        let mut active = self.active.lock();
        let tx = active.get_mut(&id).ok_or_else(|| unknown(id))?;
        if !tx.snapshots.contains_key(op.collection()) {
            let records = snapshot()?;
            tx.snapshots.insert(op.collection().to_string(), records);
        }
        tx.operations.push(op);
        Ok(())
    }

    /// Removes the transaction for commit or rollback.
    pub fn take(&self, id: Uuid) -> Result<Transaction> {
        self.active.lock().remove(&id).ok_or_else(|| unknown(id))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.active.lock().contains_key(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(id: Uuid) -> DbError {
    DbError::Transaction(format!("unknown transaction {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_is_taken_once_per_collection() {
        let manager = TransactionManager::new();
        let id = manager.begin();
        let mut snapshot_calls = 0;

        for _ in 0..3 {
            manager
                .record(
                    id,
                    PendingOp::Insert {
                        collection: "a".into(),
                        record: json!({"x": 1}),
                    },
                    || {
                        snapshot_calls += 1;
                        Ok(vec![json!({"pre": true})])
                    },
                )
                .unwrap();
        }

        assert_eq!(snapshot_calls, 1);
        let tx = manager.take(id).unwrap();
        assert_eq!(tx.operations.len(), 3);
        assert_eq!(tx.snapshots["a"], vec![json!({"pre": true})]);
        assert_eq!(tx.status, TxStatus::Pending);
    }

    #[test]
    fn unknown_transaction_is_an_error() {
        let manager = TransactionManager::new();
        let ghost = Uuid::new_v4();
        let err = manager.take(ghost).unwrap_err();
        assert_eq!(err.kind(), "transaction-error");
    }

    #[test]
    fn take_removes_the_transaction() {
        let manager = TransactionManager::new();
        let id = manager.begin();
        assert!(manager.contains(id));
        manager.take(id).unwrap();
        assert!(!manager.contains(id));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn failed_snapshot_does_not_record_the_operation() {
        let manager = TransactionManager::new();
        let id = manager.begin();
        let result = manager.record(
            id,
            PendingOp::Delete {
                collection: "a".into(),
                filter: json!({}),
            },
            || Err(DbError::FileRead("gone".into())),
        );
        assert!(result.is_err());
        let tx = manager.take(id).unwrap();
        assert!(tx.operations.is_empty());
        assert!(tx.snapshots.is_empty());
    }
}
