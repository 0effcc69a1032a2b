use crate::domain::fingerprint::MessageFingerprint;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Internal session identifier, `YYYYMMDD-HHMMSS-<8 hex>`
#[nutype(
    validate(regex = r"^\d{8}-\d{6}-[0-9a-f]{8}$"),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct InternalSessionId(String);

impl InternalSessionId {
    /// Generate an id stamped with `now`
    pub fn generate(now: DateTime<Utc>) -> Result<Self, InternalSessionIdError> {
        let random = Uuid::new_v4().simple().to_string();
        Self::try_new(format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &random[..8]))
    }

    /// Day the session was created, read from the id itself
    pub fn date(&self) -> Option<NaiveDate> {
        let id: &str = self.as_ref();
        NaiveDate::parse_from_str(id.get(..8)?, "%Y%m%d").ok()
    }
}

/// Sessions idle for longer than this report [`SessionState::Idle`]
pub const IDLE_AFTER_MINUTES: i64 = 30;

/// Lifecycle of a session as seen from its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    New,
    Active,
    Idle,
}

/// Server-side record of one logical client conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub internal_id: InternalSessionId,
    pub client_session_id: String,
    pub upstream_host: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seq: u64,
    pub fingerprint_head: MessageFingerprint,
    pub parent_id: Option<InternalSessionId>,
}

impl Session {
    pub fn new(
        internal_id: InternalSessionId,
        client_session_id: impl Into<String>,
        upstream_host: impl Into<String>,
        fingerprint_head: MessageFingerprint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            internal_id,
            client_session_id: client_session_id.into(),
            upstream_host: upstream_host.into(),
            created_at: now,
            last_seen_at: now,
            seq: 0,
            fingerprint_head,
            parent_id: None,
        }
    }

    /// Start a new lineage branching off this session
    pub fn fork(
        &self,
        internal_id: InternalSessionId,
        fingerprint_head: MessageFingerprint,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            parent_id: Some(self.internal_id.clone()),
            ..Self::new(
                internal_id,
                self.client_session_id.clone(),
                self.upstream_host.clone(),
                fingerprint_head,
                now,
            )
        }
    }

    /// Record one more interaction extending this conversation
    pub fn extend(&mut self, fingerprint_head: MessageFingerprint, now: DateTime<Utc>) -> u64 {
        self.seq += 1;
        self.fingerprint_head = fingerprint_head;
        self.last_seen_at = now;
        self.seq
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if self.seq == 0 {
            SessionState::New
        } else if now - self.last_seen_at > Duration::minutes(IDLE_AFTER_MINUTES) {
            SessionState::Idle
        } else {
            SessionState::Active
        }
    }
}

/// Session tracking failures. None of these fail the proxied request.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store error: {0}")]
    Store(String),

    #[error("corrupt session record: {0}")]
    Corrupt(String),

    #[error("invalid session id: {0}")]
    Id(#[from] InternalSessionIdError),
}

/// How a request was attached to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Started,
    Extended,
    Forked { parent_id: InternalSessionId },
    /// The session store was unavailable; the request is logged under an
    /// id that is not persisted
    Untracked,
}
