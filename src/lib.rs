//! llm-proxy - a transparent local reverse proxy for LLM APIs
//!
//! Requests to `/<provider>/<upstream-host>/<path>` are forwarded to the
//! provider untouched, streamed responses included, and every
//! request/response pair is recorded into per-session append-only logs,
//! optionally mirrored to a Loki-compatible endpoint.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod providers;
pub mod proxy;

pub use application::Application;
pub use config::Settings;
pub use error::{Error, Result};
