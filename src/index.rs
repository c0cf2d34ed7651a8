use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{DbError, Result};

/// Stringified field value → positions of the records carrying it.
pub type PostingMap = BTreeMap<String, Vec<usize>>;

/// Stringified form used for index keys and group keys: raw text for strings,
/// JSON text for everything else, `null` for null or missing.
pub fn key_string(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn index_path(db_dir: &Path, collection: &str, field: &str) -> PathBuf {
    db_dir.join(format!("{collection}.index.{field}.json"))
}

/// Advisory indexes: persisted as JSON siblings of the collection file and
/// mirrored in memory. The evaluator never requires one to answer a query;
/// they are rebuilt after mutating saves so persisted positions stay honest.
pub struct IndexManager {
    table: RwLock<HashMap<(String, String), PostingMap>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn has(&self, collection: &str, field: &str) -> bool {
        self.table
            .read()
            .contains_key(&(collection.to_string(), field.to_string()))
    }

    pub fn build(
        &self,
        db_dir: &Path,
        collection: &str,
        field: &str,
        records: &[Value],
    ) -> Result<()> {
        let postings = build_postings(records, field);
        let path = index_path(db_dir, collection, field);
        let json = serde_json::to_string_pretty(&postings)?;
        fs::write(&path, json)
            .map_err(|err| DbError::FileWrite(format!("{}: {err}", path.display())))?;
        self.table
            .write()
            .insert((collection.to_string(), field.to_string()), postings);
        Ok(())
    }

    pub fn drop_index(&self, db_dir: &Path, collection: &str, field: &str) -> Result<()> {
        self.table
            .write()
            .remove(&(collection.to_string(), field.to_string()));
        let path = index_path(db_dir, collection, field);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|err| DbError::FileWrite(format!("{}: {err}", path.display())))?;
        }
        Ok(())
    }

    /// Indexed fields for a collection, whether loaded in memory or only
    /// persisted on disk from an earlier run.
    pub fn indexed_fields(&self, db_dir: &Path, collection: &str) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self
            .table
            .read()
            .keys()
            .filter(|(owner, _)| owner == collection)
            .map(|(_, field)| field.clone())
            .collect();
        fields.extend(on_disk_fields(db_dir, collection));
        fields
    }

    pub fn rebuild_for_collection(
        &self,
        db_dir: &Path,
        collection: &str,
        records: &[Value],
    ) -> Result<()> {
        for field in self.indexed_fields(db_dir, collection) {
            self.build(db_dir, collection, &field, records)?;
        }
        Ok(())
    }

    pub fn drop_collection(&self, db_dir: &Path, collection: &str) -> Result<()> {
        for field in self.indexed_fields(db_dir, collection) {
            self.drop_index(db_dir, collection, &field)?;
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_postings(records: &[Value], field: &str) -> PostingMap {
    let mut postings = PostingMap::new();
    for (position, record) in records.iter().enumerate() {
        let key = key_string(record.as_object().and_then(|fields| fields.get(field)));
        postings.entry(key).or_default().push(position);
    }
    postings
}

fn on_disk_fields(db_dir: &Path, collection: &str) -> Vec<String> {
    let prefix = format!("{collection}.index.");
    let Ok(entries) = fs::read_dir(db_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .map(str::to_string)
        })
        .collect()
}
