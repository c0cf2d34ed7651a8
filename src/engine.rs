use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    aggregate,
    backup::{self, BackupManifest},
    cache::{CollectionCache, PatternTracker},
    config::{DbConfig, StorageMode},
    encryption::Encryptor,
    error::{DbError, Result},
    filter::FilterExpr,
    gate::{ConnectionLimiter, FileGate},
    index::IndexManager,
    permission::{Action, PermissionGate},
    query::{self, QueryOptions},
    storage,
    transaction::{PendingOp, TransactionManager, TxStatus},
};

static COLLECTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid collection name regex"));

/// The embedded engine. One instance owns one database directory; operations
/// are methods on `&self`, made safe for concurrent callers by the per-file
/// gate and the interior locks of the cache, index table, and permission
/// table.
pub struct Database {
    config: DbConfig,
    encryptor: Option<Encryptor>,
    gate: FileGate,
    limiter: ConnectionLimiter,
    cache: CollectionCache,
    patterns: PatternTracker,
    indexes: IndexManager,
    permissions: PermissionGate,
    transactions: TransactionManager,
}

impl Database {
    pub fn open(config: DbConfig) -> Result<Self> {
        config.ensure_database_dir()?;
        let permissions = PermissionGate::load(&config.auth_path(), &config.users_path())?;
        let encryptor = match config.mode {
            StorageMode::Encrypted => Some(Encryptor::new(config.encryption_key.clone())),
            StorageMode::Plain => None,
        };
        info!(
            "opened database at {} ({} mode, role '{}')",
            config.database.display(),
            config.mode,
            config.role
        );
        Ok(Self {
            cache: CollectionCache::new(config.max_cache_size),
            limiter: ConnectionLimiter::new(config.max_connections),
            gate: FileGate::new(),
            patterns: PatternTracker::new(),
            indexes: IndexManager::new(),
            transactions: TransactionManager::new(),
            permissions,
            encryptor,
            config,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    // ----- collections -----

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.check(Action::Query)?;
        collection_files(&self.config.database).map(|names| {
            names
                .into_iter()
                .filter_map(|name| name.strip_suffix(".tdbx").map(str::to_string))
                .collect()
        })
    }

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.check(Action::CreateCollection)?;
        let path = self.collection_path(name)?;
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        if path.exists() {
            return Err(DbError::Validation(format!(
                "collection '{name}' already exists"
            )));
        }
        self.write_collection_locked(name, &path, Vec::new())
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.check(Action::DropCollection)?;
        let path = self.collection_path(name)?;
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        if !path.exists() {
            return Err(DbError::Validation(format!("unknown collection '{name}'")));
        }
        fs::remove_file(&path)
            .map_err(|err| DbError::FileWrite(format!("{}: {err}", path.display())))?;
        self.cache.remove(name);
        self.patterns.forget_collection(name);
        self.indexes.drop_collection(&self.config.database, name)?;
        Ok(())
    }

    // ----- reads -----

    pub fn query(&self, name: &str, filter: &Value, options: &QueryOptions) -> Result<Vec<Value>> {
        self.check(Action::Query)?;
        let expr = FilterExpr::parse(filter)?;
        let records = self.read_collection(name)?;

        let hot = self
            .patterns
            .record(name, expr.referenced_fields().into_iter());
        for field in hot {
            self.auto_build_index(name, &field, &records)?;
        }

        query::run_query(records, &expr, options)
    }

    pub fn aggregate(&self, name: &str, pipeline: &Value) -> Result<Vec<Value>> {
        self.check(Action::Query)?;
        let stages = aggregate::parse_pipeline(pipeline)?;
        let records = self.read_collection(name)?;
        Ok(aggregate::run_pipeline(records, &stages))
    }

    // ----- mutations -----

    pub fn insert(&self, name: &str, record: Value) -> Result<()> {
        self.check(Action::Insert)?;
        ensure_record(&record)?;
        self.mutate(name, move |records| {
            records.push(record);
            Ok(())
        })
    }

    /// Shallow-merges `changes` into every record matching `filter`, returning
    /// the number of records modified.
    pub fn update(&self, name: &str, filter: &Value, changes: &Value) -> Result<usize> {
        self.check(Action::Update)?;
        let expr = FilterExpr::parse(filter)?;
        let changes = validate_changes(changes)?.clone();
        self.mutate(name, move |records| Ok(apply_update(records, &expr, &changes)))
    }

    /// Removes every record matching `filter`, returning the number removed.
    pub fn delete(&self, name: &str, filter: &Value) -> Result<usize> {
        self.check(Action::Delete)?;
        let expr = FilterExpr::parse(filter)?;
        self.mutate(name, move |records| Ok(apply_delete(records, &expr)))
    }

    // ----- indexes -----

    pub fn build_index(&self, name: &str, field: &str) -> Result<()> {
        self.check(Action::Index)?;
        let path = self.collection_path(name)?;
        let records = self.read_collection(name)?;
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        self.indexes
            .build(&self.config.database, name, field, &records)
    }

    pub fn drop_index(&self, name: &str, field: &str) -> Result<()> {
        self.check(Action::Index)?;
        let path = self.collection_path(name)?;
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        self.indexes.drop_index(&self.config.database, name, field)
    }

    // ----- transactions -----

    pub fn begin_transaction(&self) -> Uuid {
        let id = self.transactions.begin();
        debug!("began transaction {id}");
        id
    }

    pub fn transaction_insert(&self, tx: Uuid, name: &str, record: Value) -> Result<()> {
        self.check(Action::Insert)?;
        self.collection_path(name)?;
        ensure_record(&record)?;
        self.record_op(
            tx,
            PendingOp::Insert {
                collection: name.to_string(),
                record,
            },
        )
    }

    pub fn transaction_update(
        &self,
        tx: Uuid,
        name: &str,
        filter: &Value,
        changes: &Value,
    ) -> Result<()> {
        self.check(Action::Update)?;
        self.collection_path(name)?;
        FilterExpr::parse(filter)?;
        validate_changes(changes)?;
        self.record_op(
            tx,
            PendingOp::Update {
                collection: name.to_string(),
                filter: filter.clone(),
                changes: changes.clone(),
            },
        )
    }

    pub fn transaction_delete(&self, tx: Uuid, name: &str, filter: &Value) -> Result<()> {
        self.check(Action::Delete)?;
        self.collection_path(name)?;
        FilterExpr::parse(filter)?;
        self.record_op(
            tx,
            PendingOp::Delete {
                collection: name.to_string(),
                filter: filter.clone(),
            },
        )
    }

    /// Replays the transaction's operations in order. A failure partway
    /// through rolls every touched collection back to its snapshot and
    /// surfaces the original error as a transaction error.
    pub fn commit_transaction(&self, id: Uuid) -> Result<()> {
        let mut tx = self.transactions.take(id)?;
        for op in &tx.operations {
            if let Err(err) = self.apply_op(op) {
                self.restore_snapshots(&tx.snapshots)?;
                tx.status = TxStatus::RolledBack;
                debug!("transaction {id} is now {:?}", tx.status);
                return Err(DbError::Transaction(format!(
                    "commit of {id} failed and was rolled back: {err}"
                )));
            }
        }
        tx.status = TxStatus::Committed;
        debug!(
            "transaction {id} is now {:?} ({} operation(s))",
            tx.status,
            tx.operations.len()
        );
        Ok(())
    }

    pub fn rollback_transaction(&self, id: Uuid) -> Result<()> {
        let mut tx = self.transactions.take(id)?;
        self.restore_snapshots(&tx.snapshots)?;
        tx.status = TxStatus::RolledBack;
        debug!("transaction {id} is now {:?}", tx.status);
        Ok(())
    }

    // ----- backup / restore -----

    pub fn backup(&self) -> Result<PathBuf> {
        self.check(Action::Backup)?;
        backup::create_backup(&self.config.database, self.config.mode.as_str())
    }

    pub fn restore(&self, backup_dir: &Path) -> Result<BackupManifest> {
        self.check(Action::Restore)?;
        let _permit = self.limiter.acquire();

        // Hold the gate for every collection file the restore can touch.
        let mut targets = collection_files(&self.config.database)?;
        if let Ok(from_backup) = collection_files(backup_dir) {
            targets.extend(from_backup);
        }
        targets.sort();
        targets.dedup();
        let _guards: Vec<_> = targets
            .iter()
            .map(|name| self.gate.acquire(&self.config.database.join(name)))
            .collect();

        let manifest =
            backup::restore_backup(&self.config.database, backup_dir, self.config.mode.as_str())?;

        self.cache.clear();
        self.indexes.clear();
        self.patterns.clear();
        self.permissions
            .reload(&self.config.auth_path(), &self.config.users_path())?;
        Ok(manifest)
    }

    // ----- internals -----

    fn check(&self, action: Action) -> Result<()> {
        self.permissions.ensure(&self.config.role, action)
    }

    fn collection_path(&self, name: &str) -> Result<PathBuf> {
        ensure_collection_name(name)?;
        Ok(self.config.collection_path(name))
    }

    /// Cache-aware read. The cache is consulted without the gate; a stale or
    /// missing entry is refetched under it.
    fn read_collection(&self, name: &str) -> Result<Vec<Value>> {
        let path = self.collection_path(name)?;
        if let Some(records) = self.cache.fresh(name, storage::file_mtime(&path)) {
            return Ok(records);
        }

        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        // Another caller may have refreshed the entry while we waited.
        if let Some(records) = self.cache.fresh(name, storage::file_mtime(&path)) {
            return Ok(records);
        }
        let records = storage::load_records(&path, self.encryptor.as_ref())?;
        self.cache
            .store(name, records.clone(), storage::file_mtime(&path));
        Ok(records)
    }

    /// Read-modify-write under the file gate.
    fn mutate<T>(&self, name: &str, apply: impl FnOnce(&mut Vec<Value>) -> Result<T>) -> Result<T> {
        let path = self.collection_path(name)?;
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);

        let mut records = match self.cache.fresh(name, storage::file_mtime(&path)) {
            Some(records) => records,
            None => storage::load_records(&path, self.encryptor.as_ref())?,
        };
        let result = apply(&mut records)?;
        self.write_collection_locked(name, &path, records)?;
        Ok(result)
    }

    fn write_collection_locked(&self, name: &str, path: &Path, records: Vec<Value>) -> Result<()> {
        storage::save_records(path, &records, self.encryptor.as_ref())?;
        self.indexes
            .rebuild_for_collection(&self.config.database, name, &records)?;
        self.cache.store(name, records, storage::file_mtime(path));
        Ok(())
    }

    fn auto_build_index(&self, name: &str, field: &str, records: &[Value]) -> Result<()> {
        if self
            .indexes
            .indexed_fields(&self.config.database, name)
            .contains(field)
        {
            return Ok(());
        }
        let path = self.config.collection_path(name);
        let _permit = self.limiter.acquire();
        let _gate = self.gate.acquire(&path);
        self.indexes
            .build(&self.config.database, name, field, records)?;
        info!("auto-built index on {name}.{field} after repeated queries");
        Ok(())
    }

    fn record_op(&self, tx: Uuid, op: PendingOp) -> Result<()> {
        let collection = op.collection().to_string();
        self.transactions
            .record(tx, op, || self.read_collection(&collection))
    }

    fn apply_op(&self, op: &PendingOp) -> Result<()> {
        match op {
            PendingOp::Insert { collection, record } => {
                let record = record.clone();
                self.mutate(collection, move |records| {
                    records.push(record);
                    Ok(())
                })
            }
            PendingOp::Update {
                collection,
                filter,
                changes,
            } => {
                let expr = FilterExpr::parse(filter)?;
                let changes = validate_changes(changes)?.clone();
                self.mutate(collection, move |records| {
                    apply_update(records, &expr, &changes);
                    Ok(())
                })
            }
            PendingOp::Delete { collection, filter } => {
                let expr = FilterExpr::parse(filter)?;
                self.mutate(collection, move |records| {
                    apply_delete(records, &expr);
                    Ok(())
                })
            }
        }
    }

    fn restore_snapshots(&self, snapshots: &BTreeMap<String, Vec<Value>>) -> Result<()> {
        for (name, records) in snapshots {
            let path = self.config.collection_path(name);
            let _permit = self.limiter.acquire();
            let _gate = self.gate.acquire(&path);
            self.write_collection_locked(name, &path, records.clone())
                .map_err(|err| DbError::Transaction(format!("rollback of '{name}' failed: {err}")))?;
        }
        Ok(())
    }
}

fn ensure_collection_name(name: &str) -> Result<()> {
    if name.starts_with('.') {
        return Err(DbError::Validation(
            "collection names must not begin with '.' (reserved for metadata files)".into(),
        ));
    }
    if COLLECTION_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(DbError::Validation(format!(
            "invalid collection name '{name}': 1-64 characters from [A-Za-z0-9_-]"
        )))
    }
}

fn ensure_record(record: &Value) -> Result<()> {
    if record.is_object() {
        Ok(())
    } else {
        Err(DbError::Validation("insert requires a JSON object record".into()))
    }
}

fn validate_changes(changes: &Value) -> Result<&Map<String, Value>> {
    let object = changes
        .as_object()
        .ok_or_else(|| DbError::Validation("update changes must be a JSON object".into()))?;
    for key in object.keys() {
        if key.contains('.') {
            return Err(DbError::Validation(format!(
                "nested-path updates are not supported: '{key}'"
            )));
        }
    }
    Ok(object)
}

fn apply_update(records: &mut [Value], filter: &FilterExpr, changes: &Map<String, Value>) -> usize {
    let mut modified = 0;
    for record in records.iter_mut() {
        let Some(fields) = record.as_object_mut() else {
            continue;
        };
        if filter.matches(fields) {
            for (key, value) in changes {
                fields.insert(key.clone(), value.clone());
            }
            modified += 1;
        }
    }
    modified
}

fn apply_delete(records: &mut Vec<Value>, filter: &FilterExpr) -> usize {
    static EMPTY: Lazy<Map<String, Value>> = Lazy::new(Map::new);
    let before = records.len();
    records.retain(|record| !filter.matches(record.as_object().unwrap_or(&EMPTY)));
    before - records.len()
}

fn collection_files(dir: &Path) -> Result<Vec<String>> {
    let entries =
        fs::read_dir(dir).map_err(|err| DbError::FileRead(format!("{}: {err}", dir.display())))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".tdbx") && !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}
