//! Core library for the GMS (garbage management system) client.
//!
//! The centrepiece is [`auth::SessionLifecycle`], which owns the bearer
//! token, its expiry timer and the idle-timeout watchdog. Around it sit the
//! REST client, persisted session storage, the pickup-location name cache
//! and configuration.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod storage;

pub use api::{ApiClient, ApiError};
pub use auth::{
    PromptReason, PromptSurface, SessionEvent, SessionLifecycle, SessionState, TokenStatus,
    TokenVerifier,
};
pub use cache::{CacheManager, LocationNameCache};
pub use config::Config;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
