//! Durable relational + vector store backed by SQLite.
//!
//! The store owns every persisted entity. All public operations wait on
//! initialization, then run under the retry wrapper. Vector similarity is
//! cosine over embedding BLOB columns; the inverted index and job queue are
//! plain tables with the atomic claim as the single serialization point for
//! queue progress.

pub mod index;
pub mod jobs;
pub mod observations;
pub mod reports;
pub mod retry;
pub mod schema;
pub mod sql_guard;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::OrchestratorConfig;
use crate::embedding::Embedder;
use crate::types::error::StorageError;
use retry::{execute_with_retry, RetryPolicy};

/// Initialization state machine of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    NotStarted,
    Initializing,
    Initialized,
    Failed,
}

impl InitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitState::NotStarted => "not_started",
            InitState::Initializing => "initializing",
            InitState::Initialized => "initialized",
            InitState::Failed => "failed",
        }
    }
}

/// SQLite-backed research store.
pub struct ResearchStore {
    conn: tokio::sync::Mutex<Option<Connection>>,
    state_tx: watch::Sender<InitState>,
    init_guard: tokio::sync::Mutex<()>,
    init_error: parking_lot::Mutex<Option<String>>,
    identity: parking_lot::Mutex<String>,
    retry: RetryPolicy,
    config: Arc<OrchestratorConfig>,
    embedder: Arc<Embedder>,
}

impl ResearchStore {
    /// Create an uninitialized store. The first operation (or an explicit
    /// [`ResearchStore::initialize`]) opens the database.
    pub fn new(config: Arc<OrchestratorConfig>, embedder: Arc<Embedder>) -> Self {
        let (state_tx, _) = watch::channel(InitState::NotStarted);
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
        };
        Self {
            conn: tokio::sync::Mutex::new(None),
            state_tx,
            init_guard: tokio::sync::Mutex::new(()),
            init_error: parking_lot::Mutex::new(None),
            identity: parking_lot::Mutex::new(String::new()),
            retry,
            config,
            embedder,
        }
    }

    /// Current initialization state.
    pub fn state(&self) -> InitState {
        *self.state_tx.borrow()
    }

    /// Identity string of the active database ("file:…" or "in-memory
    /// fallback").
    pub fn identity(&self) -> String {
        self.identity.lock().clone()
    }

    pub(crate) fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub(crate) fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive initialization to completion. Concurrent callers share a single
    /// in-flight attempt; once terminal, the result (or cached error) is
    /// returned without re-running.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        let _guard = self.init_guard.lock().await;
        match self.state() {
            InitState::Initialized => return Ok(()),
            InitState::Failed => return Err(self.cached_init_error()),
            _ => {}
        }
        self.state_tx.send_replace(InitState::Initializing);

        match self.open_database() {
            Ok((conn, identity)) => {
                *self.conn.lock().await = Some(conn);
                *self.identity.lock() = identity;
                self.state_tx.send_replace(InitState::Initialized);
                tracing::info!(identity = %self.identity(), "store initialized");
                Ok(())
            }
            Err(e) => {
                *self.init_error.lock() = Some(e.to_string());
                self.state_tx.send_replace(InitState::Failed);
                tracing::error!("store initialization failed: {e}");
                Err(StorageError::Initialization {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn open_database(&self) -> Result<(Connection, String), StorageError> {
        let path = self.config.database_path();
        match Self::open_file_backed(&path, self.config.relaxed_durability) {
            Ok(conn) => Ok((conn, format!("file:{}", path.display()))),
            Err(e) if self.config.allow_in_memory_fallback => {
                tracing::warn!(
                    "file-backed store unavailable ({e}), falling back to in-memory store"
                );
                let conn = Connection::open_in_memory()?;
                schema::initialize_schema(&conn, self.config.relaxed_durability)?;
                Ok((conn, "in-memory fallback".to_string()))
            }
            Err(e) => Err(StorageError::Initialization {
                reason: e.to_string(),
            }),
        }
    }

    fn open_file_backed(path: &Path, relaxed: bool) -> Result<Connection, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Initialization {
                reason: format!("create dir {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path)?;
        schema::initialize_schema(&conn, relaxed)?;
        Ok(conn)
    }

    fn cached_init_error(&self) -> StorageError {
        StorageError::Initialization {
            reason: self
                .init_error
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown initialization failure".to_string()),
        }
    }

    /// Wait for initialization, triggering it lazily, bounded by the
    /// configured timeout.
    pub async fn wait_for_init(&self) -> Result<(), StorageError> {
        match self.state() {
            InitState::Initialized => return Ok(()),
            InitState::Failed => return Err(self.cached_init_error()),
            InitState::NotStarted => return self.initialize().await,
            InitState::Initializing => {}
        }

        let mut rx = self.state_tx.subscribe();
        let timeout = self.config.init_wait_timeout;
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    InitState::Initialized => return Ok(()),
                    InitState::Failed => return Err(self.cached_init_error()),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(StorageError::NotInitialized {
                        state: "closed".to_string(),
                    });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(StorageError::NotInitialized {
                    state: self.state().as_str().to_string(),
                })
            })
    }

    /// Run a database operation under the retry wrapper.
    pub(crate) async fn with_retry<T, F>(&self, name: &str, f: F) -> Result<T, StorageError>
    where
        F: Fn(&Connection) -> Result<T, StorageError>,
    {
        self.wait_for_init().await?;
        execute_with_retry(name, &self.retry, || async {
            let guard = self.conn.lock().await;
            let conn = guard.as_ref().ok_or_else(|| StorageError::NotInitialized {
                state: "closed".to_string(),
            })?;
            f(conn)
        })
        .await
    }

    /// Guarded read-only SQL execution: exactly one `SELECT`, row-limited,
    /// rows returned as JSON objects keyed by column name.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, StorageError> {
        sql_guard::validate_read_only(sql)?;
        let limited = sql_guard::apply_row_limit(sql, 1_000);
        let params = params.to_vec();

        self.with_retry("execute_query", move |conn| {
            let mut stmt = conn.prepare(&limited)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();

            let bound: Vec<Box<dyn rusqlite::types::ToSql>> = params
                .iter()
                .map(|v| -> Box<dyn rusqlite::types::ToSql> {
                    match v {
                        serde_json::Value::Null => Box::new(rusqlite::types::Null),
                        serde_json::Value::Bool(b) => Box::new(*b),
                        serde_json::Value::Number(n) => {
                            if let Some(i) = n.as_i64() {
                                Box::new(i)
                            } else {
                                Box::new(n.as_f64().unwrap_or(0.0))
                            }
                        }
                        serde_json::Value::String(s) => Box::new(s.clone()),
                        other => Box::new(other.to_string()),
                    }
                })
                .collect();
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                bound.iter().map(|p| p.as_ref()).collect();

            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::new();
                for (i, name) in column_names.iter().enumerate() {
                    let value = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                        rusqlite::types::ValueRef::Integer(v) => serde_json::json!(v),
                        rusqlite::types::ValueRef::Real(v) => serde_json::json!(v),
                        rusqlite::types::ValueRef::Text(t) => {
                            serde_json::Value::String(String::from_utf8_lossy(t).to_string())
                        }
                        rusqlite::types::ValueRef::Blob(b) => {
                            serde_json::json!(format!("<blob {} bytes>", b.len()))
                        }
                    };
                    obj.insert(name.clone(), value);
                }
                out.push(serde_json::Value::Object(obj));
            }
            Ok(out)
        })
        .await
    }

    /// Get a metadata value.
    pub async fn meta_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.with_retry("meta_get", move |conn| {
            let result = conn
                .query_row("SELECT value FROM meta WHERE key = ?1", [&key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;
            Ok(result)
        })
        .await
    }

    /// Set a metadata value.
    pub async fn meta_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_retry("meta_set", move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [&key, &value],
            )?;
            Ok(())
        })
        .await
    }

    /// Record the active embedder version. Returns `true` when the version
    /// changed since the last run (which schedules a vector reindex).
    pub async fn record_embedder_version(&self) -> Result<bool, StorageError> {
        let Some(current) = self.embedder.version_key().await else {
            return Ok(false);
        };
        let previous = self.meta_get("embedder_version").await?;
        self.meta_set("embedder_version", &current).await?;
        Ok(matches!(previous, Some(prev) if prev != current))
    }
}

/// Encode an embedding as little-endian f32 bytes.
pub(crate) fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode an embedding from little-endian f32 bytes.
pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Extension so `query_row(...).optional()` reads like rusqlite's own API.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// RFC 3339 helpers shared by the store submodules.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::database(format!("bad timestamp '{s}': {e}")))
}

impl ResearchStore {
    /// Install an in-memory connection, marking the store initialized.
    /// Test and tooling hook; production code goes through `initialize`.
    pub async fn install_memory_conn(&self) {
        let conn = Connection::open_in_memory().expect("open in-memory database");
        schema::initialize_schema(&conn, false).expect("initialize schema");
        *self.conn.lock().await = Some(conn);
        *self.identity.lock() = "in-memory".to_string();
        self.state_tx.send_replace(InitState::Initialized);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::embedding::HashEmbeddingService;

    /// In-memory store over the deterministic hash embedder.
    pub async fn memory_store() -> Arc<ResearchStore> {
        let config = Arc::new(OrchestratorConfig::default());
        let embedder = Arc::new(Embedder::with_service(Arc::new(HashEmbeddingService::new(
            256,
        ))));
        let store = Arc::new(ResearchStore::new(config, embedder));
        store.install_memory_conn().await;
        store
    }

    /// In-memory store with no embedder configured (semantic ops degrade).
    pub async fn memory_store_without_embedder() -> Arc<ResearchStore> {
        let config = Arc::new(OrchestratorConfig::default());
        let embedder = Arc::new(Embedder::unavailable(256));
        let store = Arc::new(ResearchStore::new(config, embedder));
        store.install_memory_conn().await;
        store
    }
}
