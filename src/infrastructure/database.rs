//! SQLite-backed session store
//!
//! One row per session lineage. Timestamps are stored as fixed-width
//! RFC 3339 strings so lexical order is chronological order.

use crate::domain::fingerprint::MessageFingerprint;
use crate::domain::session::{InternalSessionId, Session, SessionError};
use crate::providers::constants::sql;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;

impl From<sqlx::Error> for SessionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Session database handle
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self, SessionError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SessionError::Store(e.to_string()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal),
            )
            .await?;

        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &SqlitePool) -> Result<(), SessionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                internal_id TEXT PRIMARY KEY NOT NULL,
                client_session_id TEXT NOT NULL,
                upstream_host TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                seq INTEGER NOT NULL DEFAULT 0,
                fingerprint_head TEXT NOT NULL,
                parent_id TEXT REFERENCES sessions(internal_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_client_host \
             ON sessions(client_session_id, upstream_host)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), SessionError> {
        let row = sqlx::query(sql::HEALTH_CHECK_QUERY)
            .fetch_one(&self.pool)
            .await?;
        let value: i32 = row.try_get(sql::HEALTH_CHECK_COLUMN)?;
        if value == sql::HEALTH_CHECK_EXPECTED_VALUE {
            Ok(())
        } else {
            Err(SessionError::Store("health check returned an unexpected value".to_string()))
        }
    }

    /// All sessions for a client on an upstream, most recently seen first
    pub async fn sessions_for(
        &self,
        client_session_id: &str,
        upstream_host: &str,
    ) -> Result<Vec<Session>, SessionError> {
        let rows = sqlx::query(
            r#"
            SELECT internal_id, client_session_id, upstream_host, created_at,
                   last_seen_at, seq, fingerprint_head, parent_id
            FROM sessions
            WHERE client_session_id = ? AND upstream_host = ?
            ORDER BY last_seen_at DESC, created_at DESC
            "#,
        )
        .bind(client_session_id)
        .bind(upstream_host)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    pub async fn get(&self, internal_id: &InternalSessionId) -> Result<Option<Session>, SessionError> {
        let row = sqlx::query(
            r#"
            SELECT internal_id, client_session_id, upstream_host, created_at,
                   last_seen_at, seq, fingerprint_head, parent_id
            FROM sessions
            WHERE internal_id = ?
            "#,
        )
        .bind(internal_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    /// Insert a new session. Fails if the id already exists.
    pub async fn insert(&self, session: &Session) -> Result<(), SessionError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sessions (internal_id, client_session_id, upstream_host, created_at,
                                  last_seen_at, seq, fingerprint_head, parent_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.internal_id.as_ref())
        .bind(&session.client_session_id)
        .bind(&session.upstream_host)
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.last_seen_at))
        .bind(session.seq as i64)
        .bind(session.fingerprint_head.to_hex())
        .bind(session.parent_id.as_ref().map(|p| p.as_ref().to_string()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a new head and sequence number. `seq` never moves backwards.
    pub async fn save_progress(&self, session: &Session) -> Result<(), SessionError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE sessions
            SET seq = ?, fingerprint_head = ?, last_seen_at = ?
            WHERE internal_id = ? AND seq <= ?
            "#,
        )
        .bind(session.seq as i64)
        .bind(session.fingerprint_head.to_hex())
        .bind(format_timestamp(&session.last_seen_at))
        .bind(session.internal_id.as_ref())
        .bind(session.seq as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close every pooled connection; later queries fail
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn touch(
        &self,
        internal_id: &InternalSessionId,
        at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        sqlx::query("UPDATE sessions SET last_seen_at = ? WHERE internal_id = ? AND last_seen_at < ?")
            .bind(format_timestamp(&at))
            .bind(internal_id.as_ref())
            .bind(format_timestamp(&at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SessionError::Corrupt(format!("timestamp {s}: {e}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, SessionError> {
    let internal_id: String = row.try_get("internal_id")?;
    let created_at: String = row.try_get("created_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;
    let seq: i64 = row.try_get("seq")?;
    let head: String = row.try_get("fingerprint_head")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;

    Ok(Session {
        internal_id: InternalSessionId::try_new(internal_id)?,
        client_session_id: row.try_get("client_session_id")?,
        upstream_host: row.try_get("upstream_host")?,
        created_at: parse_timestamp(&created_at)?,
        last_seen_at: parse_timestamp(&last_seen_at)?,
        seq: u64::try_from(seq).map_err(|_| SessionError::Corrupt(format!("seq {seq}")))?,
        fingerprint_head: MessageFingerprint::from_hex(&head)
            .ok_or_else(|| SessionError::Corrupt(format!("fingerprint {head}")))?,
        parent_id: parent_id.map(InternalSessionId::try_new).transpose()?,
    })
}
