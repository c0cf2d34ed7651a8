use std::{
    fs,
    path::{Path, PathBuf},
    str,
    time::SystemTime,
};

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::{
    encryption::Encryptor,
    error::{DbError, Result},
};

pub fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Loads a collection file, applying the recovery rules: a missing file is an
/// empty collection, an empty file is re-initialized in place, and a file that
/// no longer parses is preserved as `<path>.backup.<ts>` before being reset.
pub fn load_records(path: &Path, encryptor: Option<&Encryptor>) -> Result<Vec<Value>> {
    load_records_with(path, encryptor, true)
}

pub fn load_records_with(
    path: &Path,
    encryptor: Option<&Encryptor>,
    auto_wrap: bool,
) -> Result<Vec<Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let bytes =
        fs::read(path).map_err(|err| DbError::FileRead(format!("{}: {err}", path.display())))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        save_records(path, &[], encryptor)?;
        return Ok(Vec::new());
    }

    let plaintext = match encryptor {
        Some(enc) => {
            let text = str::from_utf8(&bytes).map_err(|_| {
                DbError::Decryption(format!("{} is not a text envelope", path.display()))
            })?;
            enc.decrypt(text)?
        }
        None => bytes.clone(),
    };

    match serde_json::from_slice::<Value>(&plaintext) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(other) if auto_wrap => Ok(vec![other]),
        Ok(_) => Err(DbError::DataFormat(format!(
            "{} does not contain a JSON array",
            path.display()
        ))),
        Err(err) => {
            let backup = preserve_corrupt(path, &bytes)?;
            save_records(path, &[], encryptor)?;
            warn!(
                "recovered corrupt collection file {} ({err}); original preserved at {}",
                path.display(),
                backup.display()
            );
            Ok(Vec::new())
        }
    }
}

/// Serializes, optionally encrypts, and atomically replaces the collection
/// file via a temp-file rename. A reader observes either the old or the new
/// content in full, never a torn write.
pub fn save_records(path: &Path, records: &[Value], encryptor: Option<&Encryptor>) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    let payload = match encryptor {
        Some(enc) => enc.encrypt(json.as_bytes())?.into_bytes(),
        None => json.into_bytes(),
    };

    let tmp = tmp_path(path);
    fs::write(&tmp, &payload)
        .map_err(|err| DbError::FileWrite(format!("{}: {err}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|err| DbError::FileWrite(format!("{}: {err}", path.display())))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn preserve_corrupt(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".backup.{}", Utc::now().timestamp()));
    let backup = PathBuf::from(name);
    fs::write(&backup, bytes)
        .map_err(|err| DbError::FileWrite(format!("{}: {err}", backup.display())))?;
    Ok(backup)
}
