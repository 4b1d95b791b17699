use crate::{ServiceError, ServiceResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared sqlite handle for the record services. Each service owns one
/// table of JSON rows keyed by id; the shape mirrors a document collection
/// (upsert / find / delete) without pulling in a document server.
pub struct RecordDb {
    conn: Mutex<Connection>,
}

impl RecordDb {
    pub fn open(db_path: &Path) -> ServiceResult<Arc<Self>> {
        debug!("RecordDb: open db at {}", db_path.display());
        let conn = Connection::open(db_path).map_err(|e| {
            warn!("RecordDb: open db failed! {}", e);
            ServiceError::DbError(e.to_string())
        })?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn open_in_memory() -> ServiceResult<Arc<Self>> {
        let conn =
            Connection::open_in_memory().map_err(|e| ServiceError::DbError(e.to_string()))?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub fn ensure_table(&self, table: &str) -> ServiceResult<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        record_id TEXT PRIMARY KEY,
                        record_data TEXT NOT NULL
                    )",
                    table
                ),
                [],
            )
            .map_err(|e| ServiceError::DbError(e.to_string()))?;
        Ok(())
    }

    pub fn upsert<T: serde::Serialize>(&self, table: &str, id: &str, record: &T) -> ServiceResult<()> {
        let data = serde_json::to_string(record)
            .map_err(|e| ServiceError::Internal(format!("encode record: {}", e)))?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                &format!(
                    "INSERT INTO {} (record_id, record_data) VALUES (?1, ?2)
                     ON CONFLICT(record_id) DO UPDATE SET record_data = excluded.record_data",
                    table
                ),
                params![id, data],
            )
            .map_err(|e| ServiceError::DbError(e.to_string()))?;
        Ok(())
    }

    pub fn find<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> ServiceResult<Option<T>> {
        let data: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                &format!("SELECT record_data FROM {} WHERE record_id = ?1", table),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ServiceError::DbError(e.to_string()))?;

        match data {
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ServiceError::Internal(format!("decode record: {}", e))),
            None => Ok(None),
        }
    }

    pub fn all<T: serde::de::DeserializeOwned>(&self, table: &str) -> ServiceResult<Vec<T>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT record_data FROM {}", table))
            .map_err(|e| ServiceError::DbError(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ServiceError::DbError(e.to_string()))?
            .filter_map(|r| r.ok())
            .filter_map(|data| serde_json::from_str(&data).ok())
            .collect();
        Ok(rows)
    }

    pub fn delete(&self, table: &str, id: &str) -> ServiceResult<bool> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                &format!("DELETE FROM {} WHERE record_id = ?1", table),
                params![id],
            )
            .map_err(|e| ServiceError::DbError(e.to_string()))?;
        Ok(changed > 0)
    }

    pub fn count(&self, table: &str) -> ServiceResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .map_err(|e| ServiceError::DbError(e.to_string()))?;
        Ok(count as usize)
    }
}
