//! Application services and business logic orchestration
//!
//! This module contains application services that coordinate
//! domain logic and infrastructure components.

pub mod app;
pub mod session_manager;

pub use app::Application;
pub use session_manager::{SessionManager, SessionRef};
