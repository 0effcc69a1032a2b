//! Domain types for the proxy
//!
//! Sessions, message fingerprints, client identity, and the records that
//! make up a session log.

pub mod fingerprint;
pub mod log_entry;
pub mod session;
pub mod session_identity;

pub use fingerprint::MessageFingerprint;
pub use log_entry::{LogEntry, LogEntryKind, StreamEvent};
pub use session::{InternalSessionId, Session, SessionState, TagOutcome};
pub use session_identity::SessionIdPaths;
