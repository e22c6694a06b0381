//! SQLite-backed cache storage.
//!
//! All stores live in one database file, one row per cached entry. Deleting
//! a store cascades to its entries.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http::Method;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use url::Url;

use journeygo_common::strip_search;
use journeygo_net::ResponseType;

use crate::{ensure_cacheable, Cache, CacheError, CacheStorage, CachedResponse, MatchOptions, RequestKey};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

type SharedConnection = Arc<Mutex<Connection>>;

/// Run `f` against the connection on the blocking pool.
async fn with_conn<T, F>(conn: &SharedConnection, f: F) -> Result<T, CacheError>
where
    F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn
            .lock()
            .map_err(|_| CacheError::Storage("connection lock poisoned".to_string()))?;
        f(&guard)
    })
    .await
    .map_err(|e| CacheError::Storage(format!("blocking task failed: {}", e)))?
}

/// Initialize or open the cache database
fn init_database(conn: &Connection) -> Result<(), CacheError> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    let table_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get::<_, i32>(0).map(|count| count > 0),
    )?;

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_schema_v1(conn)?;
    }

    Ok(())
}

fn create_schema_v1(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            url_no_search TEXT NOT NULL,
            response_url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            response_type TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            UNIQUE (cache_name, method, url)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_search ON entries(cache_name, url_no_search);
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    Ok(())
}

fn response_type_to_sql(response_type: ResponseType) -> &'static str {
    match response_type {
        ResponseType::Basic => "basic",
        ResponseType::Cors => "cors",
        ResponseType::Opaque => "opaque",
    }
}

fn response_type_from_sql(value: &str) -> Result<ResponseType, CacheError> {
    match value {
        "basic" => Ok(ResponseType::Basic),
        "cors" => Ok(ResponseType::Cors),
        "opaque" => Ok(ResponseType::Opaque),
        other => Err(CacheError::InvalidEntry(format!("response type '{}'", other))),
    }
}

/// Raw column values of an `entries` row.
struct EntryRow {
    response_url: String,
    status: u16,
    headers: String,
    response_type: String,
    body: Vec<u8>,
    cached_at: i64,
}

impl EntryRow {
    const COLUMNS: &'static str = "response_url, status, headers, response_type, body, cached_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            response_url: row.get(0)?,
            status: row.get(1)?,
            headers: row.get(2)?,
            response_type: row.get(3)?,
            body: row.get(4)?,
            cached_at: row.get(5)?,
        })
    }

    fn into_snapshot(self) -> Result<CachedResponse, CacheError> {
        let url = Url::parse(&self.response_url)
            .map_err(|e| CacheError::InvalidEntry(format!("url {}: {}", self.response_url, e)))?;
        let cached_at = Utc
            .timestamp_millis_opt(self.cached_at)
            .single()
            .ok_or_else(|| CacheError::InvalidEntry(format!("timestamp {}", self.cached_at)))?;

        Ok(CachedResponse {
            url,
            status: self.status,
            headers: serde_json::from_str(&self.headers)?,
            response_type: response_type_from_sql(&self.response_type)?,
            body: Bytes::from(self.body),
            cached_at,
        })
    }
}

/// A single store inside the database.
pub struct SqliteCache {
    name: String,
    conn: SharedConnection,
}

#[async_trait]
impl Cache for SqliteCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: RequestKey, response: CachedResponse) -> Result<(), CacheError> {
        ensure_cacheable(&key)?;
        debug!(cache = %self.name, url = %key.url, status = response.status, "Cache put");

        let name = self.name.clone();
        let headers = serde_json::to_string(&response.headers)?;
        with_conn(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entries
                    (cache_name, method, url, url_no_search, response_url, status,
                     headers, response_type, body, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    name,
                    key.method.as_str(),
                    key.url.as_str(),
                    strip_search(&key.url).as_str(),
                    response.url.as_str(),
                    response.status,
                    headers,
                    response_type_to_sql(response.response_type),
                    &response.body[..],
                    response.cached_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn match_request(
        &self,
        key: &RequestKey,
        options: MatchOptions,
    ) -> Result<Option<CachedResponse>, CacheError> {
        let name = self.name.clone();
        let method = key.method.to_string();
        let (column, url) = if options.ignore_search {
            ("url_no_search", strip_search(&key.url).to_string())
        } else {
            ("url", key.url.to_string())
        };
        let sql = format!(
            "SELECT {} FROM entries
             WHERE cache_name = ?1 AND method = ?2 AND {} = ?3
             ORDER BY id LIMIT 1",
            EntryRow::COLUMNS,
            column
        );

        let row = with_conn(&self.conn, move |conn| {
            Ok(conn
                .query_row(&sql, params![name, method, url], EntryRow::from_row)
                .optional()?)
        })
        .await?;

        row.map(EntryRow::into_snapshot).transpose()
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        let name = self.name.clone();
        let method = key.method.to_string();
        let url = key.url.to_string();
        with_conn(&self.conn, move |conn| {
            let removed = conn.execute(
                "DELETE FROM entries WHERE cache_name = ?1 AND method = ?2 AND url = ?3",
                params![name, method, url],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let name = self.name.clone();
        let raw: Vec<(String, String)> = with_conn(&self.conn, move |conn| {
            let mut stmt =
                conn.prepare("SELECT method, url FROM entries WHERE cache_name = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await?;

        raw.into_iter()
            .map(|(method, url)| {
                let method = Method::from_bytes(method.as_bytes())
                    .map_err(|e| CacheError::InvalidEntry(format!("method {}: {}", method, e)))?;
                let url = Url::parse(&url)
                    .map_err(|e| CacheError::InvalidEntry(format!("url {}: {}", url, e)))?;
                Ok(RequestKey::new(method, &url))
            })
            .collect()
    }
}

/// Cache storage persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteCacheStorage {
    conn: SharedConnection,
}

impl SqliteCacheStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        init_database(&conn)?;
        info!(path = %path.display(), "Opened cache database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let owned = name.to_string();
        let created = with_conn(&self.conn, move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
                params![owned, Utc::now().timestamp_millis()],
            )?;
            Ok(inserted > 0)
        })
        .await?;

        if created {
            debug!(cache = %name, "Creating cache");
        }

        Ok(Arc::new(SqliteCache {
            name: name.to_string(),
            conn: Arc::clone(&self.conn),
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        let name = name.to_string();
        with_conn(&self.conn, move |conn| {
            Ok(conn
                .query_row("SELECT 1 FROM caches WHERE name = ?1", params![name], |_| Ok(()))
                .optional()?
                .is_some())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let owned = name.to_string();
        let removed = with_conn(&self.conn, move |conn| {
            Ok(conn.execute("DELETE FROM caches WHERE name = ?1", params![owned])? > 0)
        })
        .await?;

        if removed {
            debug!(cache = %name, "Deleted cache");
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        with_conn(&self.conn, |conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
            let names = stmt.query_map([], |row| row.get(0))?;
            Ok(names.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }
}
