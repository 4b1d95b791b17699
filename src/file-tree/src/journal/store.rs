use crate::journal::{FileAction, Lifetime};
use crate::{ContentId, FileId, FsError, FsResult, InstanceId};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Durable home of the journal: one row per lifetime plus its ordered action
/// array. Indexed on action timestamps and paths so point-in-time queries
/// stay off the lifetime table scans.
pub struct JournalStore {
    conn: Mutex<Connection>,
}

impl JournalStore {
    pub fn open(db_path: &Path) -> FsResult<Self> {
        debug!("JournalStore: open db at {}", db_path.display());
        let conn = Connection::open(db_path).map_err(|e| {
            warn!("JournalStore: open db failed! {}", e);
            FsError::DbError(e.to_string())
        })?;
        Self::from_conn(conn)
    }

    pub fn open_in_memory() -> FsResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| FsError::DbError(e.to_string()))?;
        Self::from_conn(conn)
    }

    fn from_conn(conn: Connection) -> FsResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lifetimes (
                lifetime_id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                live_path TEXT NOT NULL,
                content_id TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS actions (
                lifetime_id TEXT NOT NULL,
                ord INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                action_type TEXT NOT NULL,
                origin_path TEXT NOT NULL DEFAULT '',
                destination_path TEXT NOT NULL DEFAULT '',
                parent_id TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                content_id TEXT NOT NULL DEFAULT '',
                server_id TEXT NOT NULL,
                PRIMARY KEY (lifetime_id, ord)
            );
            CREATE INDEX IF NOT EXISTS idx_actions_timestamp ON actions (timestamp);
            CREATE INDEX IF NOT EXISTS idx_actions_origin ON actions (origin_path);
            CREATE INDEX IF NOT EXISTS idx_actions_destination ON actions (destination_path);
            CREATE INDEX IF NOT EXISTS idx_actions_server ON actions (server_id);
            CREATE INDEX IF NOT EXISTS idx_lifetimes_server ON lifetimes (server_id);",
        )
        .map_err(|e| {
            warn!("JournalStore: create schema failed! {}", e);
            FsError::DbError(e.to_string())
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Write a lifetime and its full action array, replacing any previous
    /// version of the row.
    pub fn upsert_lifetime(&self, lt: &Lifetime) -> FsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| FsError::DbError(e.to_string()))?;

        tx.execute(
            "INSERT INTO lifetimes (lifetime_id, server_id, live_path, content_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(lifetime_id) DO UPDATE SET
                 server_id = excluded.server_id,
                 live_path = excluded.live_path,
                 content_id = excluded.content_id",
            params![
                lt.id.as_str(),
                lt.server_id.as_str(),
                lt.live_file_path,
                lt.content_id.as_str()
            ],
        )
        .map_err(|e| FsError::DbError(e.to_string()))?;

        tx.execute(
            "DELETE FROM actions WHERE lifetime_id = ?1",
            params![lt.id.as_str()],
        )
        .map_err(|e| FsError::DbError(e.to_string()))?;

        for (ord, action) in lt.actions.iter().enumerate() {
            tx.execute(
                "INSERT INTO actions (lifetime_id, ord, event_id, timestamp, action_type,
                     origin_path, destination_path, parent_id, size, content_id, server_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    lt.id.as_str(),
                    ord as i64,
                    action.event_id.as_str(),
                    action.timestamp,
                    action.action_type,
                    action.origin_path,
                    action.destination_path,
                    action.parent_id.as_str(),
                    action.size,
                    action.content_id.as_str(),
                    action.server_id.as_str()
                ],
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;
        }

        tx.commit().map_err(|e| FsError::DbError(e.to_string()))
    }

    pub fn all_lifetimes(&self, server_id: &InstanceId) -> FsResult<Vec<Lifetime>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT lifetime_id, server_id, live_path, content_id
                 FROM lifetimes WHERE server_id = ?1",
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;
        let mut lifetimes: HashMap<String, Lifetime> = stmt
            .query_map(params![server_id.as_str()], |row| {
                Ok(Lifetime {
                    id: FileId::new(row.get::<_, String>(0)?),
                    server_id: InstanceId::new(row.get::<_, String>(1)?),
                    live_file_path: row.get(2)?,
                    content_id: ContentId::new(row.get::<_, String>(3)?),
                    actions: Vec::new(),
                })
            })
            .map_err(|e| FsError::DbError(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(|lt| (lt.id.0.clone(), lt))
            .collect();

        let mut stmt = conn
            .prepare(
                "SELECT lifetime_id, event_id, timestamp, action_type, origin_path,
                        destination_path, parent_id, size, content_id, server_id
                 FROM actions WHERE server_id = ?1 ORDER BY lifetime_id, ord",
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;
        let actions = stmt
            .query_map(params![server_id.as_str()], row_to_action_with_lt)
            .map_err(|e| FsError::DbError(e.to_string()))?
            .filter_map(|r| r.ok());

        for (lt_id, action) in actions {
            if let Some(lt) = lifetimes.get_mut(&lt_id) {
                lt.actions.push(action);
            }
        }

        Ok(lifetimes.into_values().filter(|lt| !lt.actions.is_empty()).collect())
    }

    pub fn latest_action(&self, server_id: &InstanceId) -> FsResult<Option<FileAction>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT lifetime_id, event_id, timestamp, action_type, origin_path,
                    destination_path, parent_id, size, content_id, server_id
             FROM actions WHERE server_id = ?1
             ORDER BY timestamp DESC LIMIT 1",
            params![server_id.as_str()],
            |row| row_to_action_with_lt(row).map(|(_, a)| a),
        )
        .optional()
        .map_err(|e| FsError::DbError(e.to_string()))
    }

    /// The most recent action per lifetime at or before `at`, restricted to
    /// lifetimes whose latest action still places them under `parent_id`.
    /// Size-change actions never relocate a file, so they are skipped when
    /// picking the placing action.
    pub fn children_at_time(&self, parent_id: &FileId, at: i64) -> FsResult<Vec<FileAction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT a.lifetime_id, a.event_id, a.timestamp, a.action_type, a.origin_path,
                        a.destination_path, a.parent_id, a.size, a.content_id, a.server_id
                 FROM actions a
                 JOIN (
                     SELECT lifetime_id, MAX(timestamp) AS ts
                     FROM actions
                     WHERE timestamp <= ?1 AND action_type != 'fileSizeChange'
                     GROUP BY lifetime_id
                 ) latest
                   ON a.lifetime_id = latest.lifetime_id AND a.timestamp = latest.ts
                 WHERE a.parent_id = ?2 AND a.destination_path != ''",
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map(params![at, parent_id.as_str()], row_to_action_with_lt)
            .map_err(|e| FsError::DbError(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(|(_, a)| a)
            .collect();
        Ok(rows)
    }

    /// Every action that touched `path` or one of its direct children,
    /// newest first.
    pub fn actions_by_path(&self, server_id: &InstanceId, path: &str) -> FsResult<Vec<FileAction>> {
        let conn = self.conn.lock().unwrap();
        let prefix = format!("{}%", path);
        let mut stmt = conn
            .prepare(
                "SELECT lifetime_id, event_id, timestamp, action_type, origin_path,
                        destination_path, parent_id, size, content_id, server_id
                 FROM actions
                 WHERE server_id = ?1 AND (origin_path LIKE ?2 OR destination_path LIKE ?2)
                 ORDER BY timestamp DESC",
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;

        let direct_child = |candidate: &str| -> bool {
            if !candidate.starts_with(path) {
                return false;
            }
            let rest = &candidate[path.len()..];
            let rest = rest.strip_suffix('/').unwrap_or(rest);
            !rest.contains('/')
        };

        let rows = stmt
            .query_map(params![server_id.as_str(), prefix], row_to_action_with_lt)
            .map_err(|e| FsError::DbError(e.to_string()))?
            .filter_map(|r| r.ok())
            .map(|(_, a)| a)
            .filter(|a| direct_child(&a.origin_path) || direct_child(&a.destination_path))
            .collect();
        Ok(rows)
    }

    /// Ids of lifetimes with any action after `since`.
    pub fn lifetime_ids_since(&self, server_id: &InstanceId, since: i64) -> FsResult<Vec<FileId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT lifetime_id FROM actions
                 WHERE server_id = ?1 AND timestamp > ?2",
            )
            .map_err(|e| FsError::DbError(e.to_string()))?;
        let rows = stmt
            .query_map(params![server_id.as_str(), since], |row| {
                Ok(FileId::new(row.get::<_, String>(0)?))
            })
            .map_err(|e| FsError::DbError(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn clear(&self, server_id: &InstanceId) -> FsResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM actions WHERE server_id = ?1",
            params![server_id.as_str()],
        )
        .map_err(|e| FsError::DbError(e.to_string()))?;
        conn.execute(
            "DELETE FROM lifetimes WHERE server_id = ?1",
            params![server_id.as_str()],
        )
        .map_err(|e| FsError::DbError(e.to_string()))?;
        Ok(())
    }
}

fn row_to_action_with_lt(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, FileAction)> {
    let lt_id: String = row.get(0)?;
    let action = FileAction {
        life_id: FileId::new(lt_id.clone()),
        event_id: crate::EventId::new(row.get::<_, String>(1)?),
        timestamp: row.get(2)?,
        action_type: row.get(3)?,
        origin_path: row.get(4)?,
        destination_path: row.get(5)?,
        parent_id: FileId::new(row.get::<_, String>(6)?),
        size: row.get(7)?,
        content_id: ContentId::new(row.get::<_, String>(8)?),
        server_id: InstanceId::new(row.get::<_, String>(9)?),
    };
    Ok((lt_id, action))
}
