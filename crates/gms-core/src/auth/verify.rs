use std::future::Future;

use serde::Serialize;

use crate::api::ApiError;

/// Something that can ask the backend whether a token is still accepted.
///
/// `Ok(false)` and any non-connectivity error mean the token is rejected;
/// an error with [`ApiError::is_connectivity`] means the question could not
/// be answered.
pub trait TokenVerifier: Sync {
    fn verify(&self, token: &str) -> impl Future<Output = Result<bool, ApiError>> + Send;
}

/// Outcome of a remote verification after fail-open handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum TokenStatus {
    Valid,
    Invalid,
}

impl TokenStatus {
    pub fn is_valid(self) -> bool {
        self == TokenStatus::Valid
    }
}
