//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionLifecycle`: token storage, hard expiry and the idle-timeout watchdog
//! - `claims`: best-effort decoding of token payload fields
//! - `TokenVerifier`: the seam used for remote token verification
//! - `CredentialStore`: OS keychain access for the session storage key
//!
//! Tokens expire 30 minutes after login by default; the idle timeout is
//! configured separately.

pub mod claims;
pub mod credentials;
pub mod lifecycle;
pub mod verify;

pub use claims::TokenClaims;
pub use credentials::CredentialStore;
pub use lifecycle::{
    PromptReason, PromptSurface, Session, SessionEvent, SessionLifecycle, SessionSettings,
    SessionState, TimeoutState,
};
pub use verify::{TokenStatus, TokenVerifier};
