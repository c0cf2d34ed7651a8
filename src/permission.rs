use std::{collections::BTreeMap, fmt, fs, path::Path};

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Query,
    Insert,
    Update,
    Delete,
    Index,
    CreateCollection,
    DropCollection,
    Backup,
    Restore,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Query,
        Action::Insert,
        Action::Update,
        Action::Delete,
        Action::Index,
        Action::CreateCollection,
        Action::DropCollection,
        Action::Backup,
        Action::Restore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Index => "index",
            Self::CreateCollection => "create_collection",
            Self::DropCollection => "drop_collection",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role → permitted actions, backed by the `.auth` document next to the
/// collection files. Every public engine entry point consults this table
/// before touching storage.
pub struct PermissionGate {
    roles: RwLock<BTreeMap<String, Vec<String>>>,
    users: RwLock<BTreeMap<String, Value>>,
}

impl PermissionGate {
    /// Loads `.auth` (writing the default role table when absent) and the
    /// optional `.users` document.
    pub fn load(auth_path: &Path, users_path: &Path) -> Result<Self> {
        let gate = Self {
            roles: RwLock::new(BTreeMap::new()),
            users: RwLock::new(BTreeMap::new()),
        };
        gate.reload(auth_path, users_path)?;
        Ok(gate)
    }

    pub fn reload(&self, auth_path: &Path, users_path: &Path) -> Result<()> {
        let roles = if auth_path.exists() {
            parse_auth_document(auth_path)?
        } else {
            let defaults = default_roles();
            let json = serde_json::to_string_pretty(&defaults)?;
            fs::write(auth_path, json)
                .map_err(|err| DbError::FileWrite(format!("{}: {err}", auth_path.display())))?;
            defaults
        };
        *self.roles.write() = roles;

        let users = if users_path.exists() {
            parse_users_document(users_path)?
        } else {
            BTreeMap::new()
        };
        *self.users.write() = users;
        Ok(())
    }

    pub fn ensure(&self, role: &str, action: Action) -> Result<()> {
        let roles = self.roles.read();
        let allowed = roles.get(role).cloned().unwrap_or_default();
        if allowed.iter().any(|name| name == action.as_str()) {
            Ok(())
        } else {
            Err(DbError::Permission {
                role: role.to_string(),
                action: action.as_str(),
                allowed,
            })
        }
    }

    pub fn user_role(&self, user: &str) -> Option<String> {
        self.users
            .read()
            .get(user)
            .and_then(|entry| entry.get("role"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

fn default_roles() -> BTreeMap<String, Vec<String>> {
    let all: Vec<String> = Action::ALL.iter().map(|a| a.as_str().to_string()).collect();
    BTreeMap::from([
        ("admin".to_string(), all),
        (
            "editor".to_string(),
            ["query", "insert", "update", "delete", "index"]
                .map(str::to_string)
                .to_vec(),
        ),
        ("reader".to_string(), vec!["query".to_string()]),
    ])
}

fn parse_auth_document(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let contents = fs::read_to_string(path)
        .map_err(|err| DbError::FileRead(format!("{}: {err}", path.display())))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| DbError::DataCorruption(format!("{}: {err}", path.display())))?;
    let object = value.as_object().ok_or_else(|| {
        DbError::DataFormat(format!("{} must be a JSON object", path.display()))
    })?;

    let mut roles = BTreeMap::new();
    for (role, actions) in object {
        let actions = actions.as_array().ok_or_else(|| {
            DbError::DataFormat(format!("role '{role}' must map to an array of actions"))
        })?;
        let names = actions
            .iter()
            .map(|action| {
                action.as_str().map(str::to_string).ok_or_else(|| {
                    DbError::DataFormat(format!("role '{role}' contains a non-string action"))
                })
            })
            .collect::<Result<Vec<String>>>()?;
        roles.insert(role.clone(), names);
    }
    Ok(roles)
}

fn parse_users_document(path: &Path) -> Result<BTreeMap<String, Value>> {
    let contents = fs::read_to_string(path)
        .map_err(|err| DbError::FileRead(format!("{}: {err}", path.display())))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| DbError::DataCorruption(format!("{}: {err}", path.display())))?;
    let object: &Map<String, Value> = value.as_object().ok_or_else(|| {
        DbError::DataFormat(format!("{} must be a JSON object", path.display()))
    })?;
    Ok(object
        .iter()
        .map(|(user, entry)| (user.clone(), entry.clone()))
        .collect())
}
