//! `manifest.sqlite` table definitions and pragma setup.

use rusqlite::Connection;

use crate::error::Result;
use crate::item::StorageType;

pub(super) const CREATE_MANIFEST: &str = "
    CREATE TABLE IF NOT EXISTS manifest (
        key               TEXT PRIMARY KEY,
        filename          TEXT,
        size              INTEGER NOT NULL,
        inline_data       BLOB,
        modification_time INTEGER NOT NULL,
        last_access_time  INTEGER NOT NULL,
        extended_data     BLOB
    )";

const CREATE_ACCESS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_manifest_last_access ON manifest(last_access_time)";
const CREATE_SIZE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_manifest_size ON manifest(size)";

const CREATE_META: &str = "
    CREATE TABLE IF NOT EXISTS cache_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )";

/// Applies pragmas and creates the schema if this is a fresh directory.
/// Crash-consistency relies on `synchronous=FULL`: every commit is fsynced
/// before it's acknowledged.
pub(super) fn initialize(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.execute(CREATE_MANIFEST, [])?;
    conn.execute(CREATE_ACCESS_INDEX, [])?;
    conn.execute(CREATE_SIZE_INDEX, [])?;
    conn.execute(CREATE_META, [])?;
    Ok(())
}

fn storage_type_tag(storage_type: StorageType) -> &'static str {
    match storage_type {
        StorageType::File => "file",
        StorageType::Sqlite => "sqlite",
        StorageType::Mixed => "mixed",
    }
}

/// Records `storage_type` as immutable for this directory, or verifies a
/// prior run recorded the same type.
pub(super) fn enforce_storage_type(conn: &Connection, storage_type: StorageType) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM cache_meta WHERE key = 'storage_type'",
            [],
            |row| row.get(0),
        )
        .ok();
    match existing {
        Some(tag) if tag == storage_type_tag(storage_type) => Ok(()),
        Some(tag) => Err(crate::error::Error::InvalidInput {
            reason: format!(
                "directory was created with storage type {tag:?}, cannot reopen as {:?}",
                storage_type_tag(storage_type)
            ),
        }),
        None => {
            conn.execute(
                "INSERT INTO cache_meta (key, value) VALUES ('storage_type', ?1)",
                [storage_type_tag(storage_type)],
            )?;
            Ok(())
        }
    }
}
