//! Wire types exchanged with the GMS backend.

pub mod auth;
pub mod location;

pub use auth::{LoginRequest, LoginResponse, VerifyResponse};
pub use location::{PickupLocation, PickupLocationResponse};
