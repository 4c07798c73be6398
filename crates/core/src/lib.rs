//! Core library for copilot-bridge.
//!
//! Exchanges GitHub user tokens for Copilot access tokens and relays
//! OpenAI-style chat/completions and embeddings requests to Copilot.

pub mod config;
pub mod error;
pub mod github;
pub mod headers;
pub mod proxy;
pub mod token_cache;

pub use crate::config::BridgeConfig;
pub use crate::error::BridgeError;
pub use crate::proxy::{ProxyService, router};
