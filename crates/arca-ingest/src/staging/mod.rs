//! Per-bag staging database
//!
//! Each in-flight bag gets one SQLite file (`<bag>.valdb`) holding the
//! serialized `IntellectualObject` and every `GenericFile` as JSON rows.
//! Workers read and write through this file between stages, so a crashed
//! stage can be resumed without refetching or revalidating anything.
//! SQLite's file locking gives us the one-writer-per-file invariant.

use crate::models::{GenericFile, IntellectualObject};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Handle to one bag's staging database.
pub struct StagingDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl StagingDb {
    /// Open (creating if needed) the staging DB at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open staging db {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// In-memory DB for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory staging db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Staging db lock poisoned"))
    }

    /// Save the intellectual object under its identifier.
    pub fn put_object(&self, object: &IntellectualObject) -> Result<()> {
        let json = serde_json::to_string(object)?;
        self.conn()?
            .execute(
                "INSERT INTO objects (identifier, data) VALUES (?1, ?2)
                 ON CONFLICT(identifier) DO UPDATE SET data = excluded.data",
                params![object.identifier, json],
            )
            .context("Failed to save object")?;
        Ok(())
    }

    pub fn get_object(&self, identifier: &str) -> Result<Option<IntellectualObject>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM objects WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query object")?;
        match json {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    /// The identifier of the one object this DB stages, if any.
    pub fn object_identifier(&self) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row("SELECT identifier FROM objects LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .context("Failed to query object identifier")
    }

    pub fn put_file(&self, file: &GenericFile) -> Result<()> {
        let json = serde_json::to_string(file)?;
        self.conn()?
            .execute(
                "INSERT INTO files (identifier, data) VALUES (?1, ?2)
                 ON CONFLICT(identifier) DO UPDATE SET data = excluded.data",
                params![file.identifier, json],
            )
            .context("Failed to save file")?;
        Ok(())
    }

    pub fn get_file(&self, identifier: &str) -> Result<Option<GenericFile>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT data FROM files WHERE identifier = ?1",
                params![identifier],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query file")?;
        match json {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    /// All file identifiers in identifier order.
    pub fn file_identifiers(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT identifier FROM files ORDER BY identifier")?;
        let identifiers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(identifiers)
    }

    /// A window of file identifiers, ordered, for batch processing.
    /// Out-of-range or negative windows return an empty list.
    pub fn file_identifier_batch(&self, offset: i64, limit: i64) -> Result<Vec<String>> {
        if offset < 0 || limit <= 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT identifier FROM files ORDER BY identifier LIMIT ?1 OFFSET ?2")?;
        let identifiers = stmt
            .query_map(params![limit, offset], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(identifiers)
    }

    pub fn file_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Write the staged object as one JSON document, with all of its files
    /// embedded. This is what `validate_bag --outfile` dumps.
    pub fn dump_json(&self, writer: &mut impl Write) -> Result<()> {
        let identifier = self
            .object_identifier()?
            .ok_or_else(|| anyhow::anyhow!("Staging db holds no object"))?;
        let mut object = self
            .get_object(&identifier)?
            .ok_or_else(|| anyhow::anyhow!("Staging db holds no object"))?;
        object.generic_files.clear();
        for file_identifier in self.file_identifiers()? {
            if let Some(file) = self.get_file(&file_identifier)? {
                object.generic_files.push(file);
            }
        }
        serde_json::to_writer_pretty(&mut *writer, &object)?;
        writer.flush()?;
        Ok(())
    }

    /// Remove the staging DB file itself. Call only after the registry has
    /// the full record.
    pub fn delete_db_file(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if !path.as_os_str().is_empty() && path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Cannot delete staging db {}", path.display()))?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS objects (
            identifier TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS files (
            identifier TEXT PRIMARY KEY,
            data TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_file(identifier: &str) -> GenericFile {
        let mut gf = GenericFile::new("uc.edu/bag", identifier);
        gf.size = 100;
        gf
    }

    #[test]
    fn test_save_and_get_object() {
        let db = StagingDb::open_in_memory().unwrap();
        let object = IntellectualObject::new("uc.edu", "bag");
        db.put_object(&object).unwrap();

        let restored = db.get_object("uc.edu/bag").unwrap().unwrap();
        assert_eq!(restored.identifier, "uc.edu/bag");
        assert!(db.get_object("uc.edu/nothing").unwrap().is_none());
        assert_eq!(db.object_identifier().unwrap().unwrap(), "uc.edu/bag");
    }

    #[test]
    fn test_save_and_get_files() {
        let db = StagingDb::open_in_memory().unwrap();
        for i in 0..10 {
            db.put_file(&make_file(&format!("data/file_{:02}.json", i)))
                .unwrap();
        }
        assert_eq!(db.file_count().unwrap(), 10);
        let gf = db
            .get_file("uc.edu/bag/data/file_03.json")
            .unwrap()
            .unwrap();
        assert_eq!(gf.size, 100);
        assert!(db.get_file("uc.edu/bag/nope").unwrap().is_none());

        // Updating in place must not create a second row.
        let mut gf = gf;
        gf.size = 200;
        db.put_file(&gf).unwrap();
        assert_eq!(db.file_count().unwrap(), 10);
        assert_eq!(
            db.get_file("uc.edu/bag/data/file_03.json")
                .unwrap()
                .unwrap()
                .size,
            200
        );
    }

    #[test]
    fn test_file_identifier_batch() {
        let db = StagingDb::open_in_memory().unwrap();
        for i in 0..20 {
            db.put_file(&make_file(&format!("data/file_{:02}.json", i)))
                .unwrap();
        }

        let batch = db.file_identifier_batch(0, 5).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0], "uc.edu/bag/data/file_00.json");
        assert_eq!(batch[4], "uc.edu/bag/data/file_04.json");

        let batch = db.file_identifier_batch(15, 5).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0], "uc.edu/bag/data/file_15.json");
        assert_eq!(batch[4], "uc.edu/bag/data/file_19.json");

        assert!(db.file_identifier_batch(20, 5).unwrap().is_empty());
        assert!(db.file_identifier_batch(-100, -20).unwrap().is_empty());
    }

    #[test]
    fn test_dump_json() {
        let db = StagingDb::open_in_memory().unwrap();
        db.put_object(&IntellectualObject::new("uc.edu", "bag")).unwrap();
        for i in 0..3 {
            db.put_file(&make_file(&format!("data/file_{}.json", i)))
                .unwrap();
        }

        let mut buffer = Vec::new();
        db.dump_json(&mut buffer).unwrap();
        let object: IntellectualObject = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(object.identifier, "uc.edu/bag");
        assert_eq!(object.generic_files.len(), 3);
    }

    #[test]
    fn test_delete_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bag.valdb");
        let db = StagingDb::open(&path).unwrap();
        db.put_object(&IntellectualObject::new("uc.edu", "bag")).unwrap();
        assert!(path.exists());
        db.delete_db_file().unwrap();
        assert!(!path.exists());
    }
}
