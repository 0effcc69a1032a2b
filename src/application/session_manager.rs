//! Attaching requests to sessions
//!
//! Sessions form a tree per `(client_session_id, upstream_host)`. A request
//! extends the session whose recorded head appears among its prefix
//! fingerprints; the deepest match wins, ties going to the most recently
//! seen session. A request that extends none of them forks the most recent
//! one. All decisions for one key are serialised by an in-memory lock, so the
//! first writer to reach a divergence creates the fork.

use crate::domain::fingerprint::{extract_messages, prefix_fingerprints, MessageFingerprint};
use crate::domain::log_entry::{EntryContext, ForkRecord, LogEntry, LogEntryKind, SessionStartRecord};
use crate::domain::session::{InternalSessionId, Session, SessionError, SessionState, TagOutcome};
use crate::domain::session_identity::{SessionIdPaths, DEFAULT_CLIENT_SESSION_ID};
use crate::infrastructure::database::SessionStore;
use crate::infrastructure::log_messages::{database as db_msg, session as msg};
use crate::infrastructure::multi_sink::MultiSinkWriter;
use crate::providers::Provider;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entries kept in the lock table before idle locks are pruned
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 1024;

type SessionKey = (String, String);

/// Per-`(client_session_id, upstream_host)` async locks
#[derive(Default)]
pub struct SessionLockTable {
    locks: parking_lot::Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLockTable {
    pub async fn acquire(&self, client_session_id: &str, upstream_host: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() >= LOCK_TABLE_PRUNE_THRESHOLD {
                // Only the table holds an unused lock
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(
                locks
                    .entry((client_session_id.to_string(), upstream_host.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request's place in a session, held from tagging until completion
pub struct SessionRef {
    pub client_session_id: String,
    pub seq: u64,
    pub outcome: TagOutcome,
    /// The extended session had gone idle before this request
    pub resumed: bool,
    pub context: EntryContext,
    persisted: Option<InternalSessionId>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionRef {
    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    /// Build an entry for this request's interaction
    pub fn entry(&self, kind: LogEntryKind) -> LogEntry {
        self.context.entry(self.seq, kind)
    }

    /// Let other requests of the same client proceed. Used once a streamed
    /// response starts, since its entry is only written at stream end.
    pub fn release_lock(&mut self) {
        self.guard = None;
    }

    pub fn holds_lock(&self) -> bool {
        self.guard.is_some()
    }
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRef")
            .field("session_id", &self.context.session_id)
            .field("client_session_id", &self.client_session_id)
            .field("seq", &self.seq)
            .field("outcome", &self.outcome)
            .field("resumed", &self.resumed)
            .finish()
    }
}

struct Tagged {
    session: Session,
    outcome: TagOutcome,
    resumed: bool,
}

pub struct SessionManager {
    store: SessionStore,
    sink: Arc<MultiSinkWriter>,
    id_paths: SessionIdPaths,
    locks: SessionLockTable,
}

impl SessionManager {
    pub fn new(store: SessionStore, sink: Arc<MultiSinkWriter>, id_paths: SessionIdPaths) -> Self {
        Self {
            store,
            sink,
            id_paths,
            locks: SessionLockTable::default(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Attach a request to a session, writing `session_start` and `fork`
    /// entries as needed. `base` supplies every entry field except the
    /// session id. Never fails: if the store is unavailable the request is
    /// logged under a fresh untracked id.
    pub async fn tag(
        &self,
        provider: Provider,
        upstream_host: &str,
        body: &[u8],
        base: &EntryContext,
    ) -> SessionRef {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let client_session_id = parsed
            .as_ref()
            .and_then(|body| self.id_paths.extract(provider, body))
            .unwrap_or_else(|| DEFAULT_CLIENT_SESSION_ID.to_string());
        let messages = parsed.as_ref().map(extract_messages).unwrap_or_default();
        let prefixes = prefix_fingerprints(&messages);

        let guard = self.locks.acquire(&client_session_id, upstream_host).await;
        let now = Utc::now();

        match self
            .tag_locked(&client_session_id, upstream_host, &prefixes, now, base)
            .await
        {
            Ok(Tagged {
                session,
                outcome,
                resumed,
            }) => SessionRef {
                client_session_id,
                seq: session.seq,
                outcome,
                resumed,
                context: base.for_session(session.internal_id.to_string()),
                persisted: Some(session.internal_id),
                guard: Some(guard),
            },
            Err(e) => {
                warn!(error = %e, client_session_id, upstream_host, "{}", db_msg::UNAVAILABLE);
                self.untracked(client_session_id, &prefixes, now, base, guard)
            }
        }
    }

    /// Mark the interaction finished and release the session lock
    pub async fn complete(&self, session: SessionRef) {
        if let Some(id) = &session.persisted {
            if let Err(e) = self.store.touch(id, Utc::now()).await {
                warn!(error = %e, session_id = %id, "{}", db_msg::UNAVAILABLE);
            }
        }
        drop(session);
    }

    async fn tag_locked(
        &self,
        client_session_id: &str,
        upstream_host: &str,
        prefixes: &[MessageFingerprint],
        now: DateTime<Utc>,
        base: &EntryContext,
    ) -> Result<Tagged, SessionError> {
        let head = prefixes.last().copied().unwrap_or_else(MessageFingerprint::empty);
        let sessions = self.store.sessions_for(client_session_id, upstream_host).await?;

        let Some(most_recent) = sessions.first() else {
            let mut session = Session::new(
                InternalSessionId::generate(now)?,
                client_session_id,
                upstream_host,
                head,
                now,
            );
            session.seq = 1;
            self.store.insert(&session).await?;

            info!(session_id = %session.internal_id, client_session_id, upstream_host, "{}", msg::STARTED);
            self.sink.emit(base.for_session(session.internal_id.to_string()).entry(
                0,
                LogEntryKind::SessionStart(SessionStartRecord {
                    client_session_id: client_session_id.to_string(),
                    fingerprint_head: head.to_hex(),
                }),
            ));
            return Ok(Tagged {
                session,
                outcome: TagOutcome::Started,
                resumed: false,
            });
        };

        if let Some(existing) = best_extension(&sessions, prefixes) {
            let resumed = existing.state(now) == SessionState::Idle;
            if resumed {
                info!(
                    session_id = %existing.internal_id,
                    last_seen_at = %existing.last_seen_at,
                    client_session_id,
                    upstream_host,
                    "{}",
                    msg::RESUMED
                );
            } else {
                debug!(session_id = %existing.internal_id, state = ?existing.state(now), "Extending session");
            }
            let mut session = existing.clone();
            let new_head = if prefixes.is_empty() {
                session.fingerprint_head
            } else {
                head
            };
            session.extend(new_head, now);
            self.store.save_progress(&session).await?;
            return Ok(Tagged {
                session,
                outcome: TagOutcome::Extended,
                resumed,
            });
        }

        let parent = most_recent;
        let mut child = parent.fork(InternalSessionId::generate(now)?, head, now);
        child.seq = 1;
        self.store.insert(&child).await?;

        info!(
            session_id = %child.internal_id,
            parent_id = %parent.internal_id,
            client_session_id,
            upstream_host,
            "{}",
            msg::FORKED
        );

        let record = ForkRecord {
            client_session_id: client_session_id.to_string(),
            parent_id: parent.internal_id.to_string(),
            child_id: child.internal_id.to_string(),
            parent_fingerprint_head: parent.fingerprint_head.to_hex(),
            fingerprint_head: head.to_hex(),
        };
        self.sink.emit(
            base.for_session(parent.internal_id.to_string())
                .entry(parent.seq, LogEntryKind::Fork(record.clone())),
        );
        self.sink.emit(
            base.for_session(child.internal_id.to_string())
                .entry(0, LogEntryKind::Fork(record)),
        );

        Ok(Tagged {
            outcome: TagOutcome::Forked {
                parent_id: parent.internal_id.clone(),
            },
            session: child,
            resumed: false,
        })
    }

    fn untracked(
        &self,
        client_session_id: String,
        prefixes: &[MessageFingerprint],
        now: DateTime<Utc>,
        base: &EntryContext,
        guard: OwnedMutexGuard<()>,
    ) -> SessionRef {
        let session_id = InternalSessionId::generate(now)
            .map(|id| id.to_string())
            .unwrap_or_else(|_| Uuid::new_v4().simple().to_string());
        let head = prefixes.last().copied().unwrap_or_else(MessageFingerprint::empty);
        let context = base.for_session(session_id);

        self.sink.emit(context.entry(
            0,
            LogEntryKind::SessionStart(SessionStartRecord {
                client_session_id: client_session_id.clone(),
                fingerprint_head: head.to_hex(),
            }),
        ));

        SessionRef {
            client_session_id,
            seq: 1,
            outcome: TagOutcome::Untracked,
            resumed: false,
            context,
            persisted: None,
            guard: Some(guard),
        }
    }
}

/// The session this request extends, if any. `sessions` is most recent
/// first. A session recorded without messages is extended by anything.
fn best_extension<'a>(sessions: &'a [Session], prefixes: &[MessageFingerprint]) -> Option<&'a Session> {
    if prefixes.is_empty() {
        return sessions.first();
    }

    let empty = MessageFingerprint::empty();
    let mut best: Option<(usize, &Session)> = None;
    for session in sessions {
        let depth = if session.fingerprint_head == empty {
            Some(0)
        } else {
            prefixes
                .iter()
                .position(|prefix| *prefix == session.fingerprint_head)
                .map(|i| i + 1)
        };
        if let Some(depth) = depth {
            if best.map_or(true, |(best_depth, _)| depth > best_depth) {
                best = Some((depth, session));
            }
        }
    }
    best.map(|(_, session)| session)
}
