//! Local caching for pickup-location data.
//!
//! `CacheManager` keeps JSON snapshots on disk, considered stale after
//! 60 minutes. `LocationNameCache` resolves location ids to display names,
//! falling back to the API and finally to a name derived from the id.

pub mod location_names;
pub mod manager;

pub use location_names::{LocationNameCache, LocationSource};
pub use manager::{CacheManager, CachedData};
