//! REST API client module for the GMS backend.
//!
//! This module provides the `ApiClient` for signing in, verifying tokens
//! and fetching pickup locations.
//!
//! The API uses JWT bearer token authentication obtained from
//! `POST /api/auth/login`.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
