//! AWS Bedrock provider support
//!
//! ## Features
//!
//! - SigV4 signing with credentials from the ambient AWS chain
//! - Model-id extraction and validation from the request path
//! - Eventstream decoding for InvokeModelWithResponseStream logging
//! - Decode-error accounting for `/health/bedrock`

pub mod auth;
pub mod eventstream;
pub mod health;
pub mod models;
pub mod provider;
pub mod types;

pub use provider::BedrockProvider;
