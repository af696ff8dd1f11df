//! SQLite-backed thread store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde_json::Value;

use murmur_core::current_unix_timestamp_ms;

use crate::{is_image_record, CachedMessage, StoreError, ThreadStore};

#[derive(Debug, Clone)]
/// SQLite implementation of `ThreadStore`. Connections are opened per
/// operation so the handle stays trivially shareable across tasks.
pub struct SqliteThreadStore {
    path: PathBuf,
}

impl SqliteThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(&self.path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        initialize_schema(&connection)?;
        Ok(connection)
    }
}

fn initialize_schema(connection: &Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS thread_messages (
            id INTEGER PRIMARY KEY,
            thread_key TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            ts TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_thread_messages_thread_key
            ON thread_messages(thread_key);
        CREATE TABLE IF NOT EXISTS thread_configs (
            thread_key TEXT PRIMARY KEY,
            config_json TEXT NOT NULL,
            updated_unix_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn row_to_record(
    role: String,
    content: String,
    metadata_json: String,
    ts: String,
) -> Result<CachedMessage, StoreError> {
    let metadata = serde_json::from_str::<Value>(&metadata_json)?;
    Ok(CachedMessage {
        role,
        content,
        metadata,
        ts,
    })
}

impl ThreadStore for SqliteThreadStore {
    fn cache_message(&self, thread_key: &str, record: &CachedMessage) -> Result<(), StoreError> {
        let connection = self.open_connection()?;
        let metadata_json = serde_json::to_string(&record.metadata)?;
        connection.execute(
            r#"
            INSERT INTO thread_messages (thread_key, role, content, metadata_json, ts)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                thread_key,
                record.role,
                record.content,
                metadata_json,
                record.ts
            ],
        )?;
        Ok(())
    }

    fn cached_messages(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT role, content, metadata_json, ts
            FROM thread_messages
            WHERE thread_key = ?1
            ORDER BY id ASC
            "#,
        )?;
        let mut rows = statement.query(params![thread_key])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            )?);
        }
        Ok(records)
    }

    fn clear_thread_messages(&self, thread_key: &str) -> Result<(), StoreError> {
        let connection = self.open_connection()?;
        connection.execute(
            "DELETE FROM thread_messages WHERE thread_key = ?1",
            params![thread_key],
        )?;
        Ok(())
    }

    fn replace_thread_messages(
        &self,
        thread_key: &str,
        records: &[CachedMessage],
    ) -> Result<(), StoreError> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        transaction.execute(
            "DELETE FROM thread_messages WHERE thread_key = ?1",
            params![thread_key],
        )?;
        for record in records {
            let metadata_json = serde_json::to_string(&record.metadata)?;
            transaction.execute(
                r#"
                INSERT INTO thread_messages (thread_key, role, content, metadata_json, ts)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    thread_key,
                    record.role,
                    record.content,
                    metadata_json,
                    record.ts
                ],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn find_thread_images(&self, thread_key: &str) -> Result<Vec<CachedMessage>, StoreError> {
        let records = self.cached_messages(thread_key)?;
        Ok(records
            .into_iter()
            .filter(|record| is_image_record(&record.metadata))
            .collect())
    }

    fn thread_config(&self, thread_key: &str) -> Result<Option<Value>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT config_json
            FROM thread_configs
            WHERE thread_key = ?1
            "#,
        )?;
        let mut rows = statement.query(params![thread_key])?;
        match rows.next()? {
            Some(row) => {
                let config_json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&config_json)?))
            }
            None => Ok(None),
        }
    }

    fn save_thread_config(&self, thread_key: &str, config: &Value) -> Result<(), StoreError> {
        let connection = self.open_connection()?;
        let config_json = serde_json::to_string(config)?;
        connection.execute(
            r#"
            INSERT INTO thread_configs (thread_key, config_json, updated_unix_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(thread_key) DO UPDATE SET
                config_json = excluded.config_json,
                updated_unix_ms = excluded.updated_unix_ms
            "#,
            params![thread_key, config_json, current_unix_timestamp_ms()],
        )?;
        Ok(())
    }
}
