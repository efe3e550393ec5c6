use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::CacheManager;
use crate::api::ApiClient;
use crate::models::PickupLocation;

/// Where location names come from when they are not cached.
pub trait LocationSource: Sync {
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<PickupLocation>>> + Send;
    fn fetch_one(&self, id: &str) -> impl Future<Output = Result<PickupLocation>> + Send;
}

impl LocationSource for ApiClient {
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<PickupLocation>>> + Send {
        self.fetch_pickup_locations()
    }

    fn fetch_one(&self, id: &str) -> impl Future<Output = Result<PickupLocation>> + Send {
        self.fetch_pickup_location(id)
    }
}

/// Memoizes pickup location id → site name.
///
/// Lookups never fail: when neither the cache nor the source can supply a
/// name, one is derived from the id.
pub struct LocationNameCache<S> {
    source: S,
    disk: Option<CacheManager>,
    names: RwLock<HashMap<String, String>>,
}

impl<S: LocationSource> LocationNameCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            disk: None,
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Persist prefetched locations through `disk`.
    pub fn with_disk_cache(mut self, disk: CacheManager) -> Self {
        self.disk = Some(disk);
        self
    }

    pub async fn len(&self) -> usize {
        self.names.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.names.read().await.is_empty()
    }

    /// Seed the map from a non-stale disk snapshot. Returns the number of
    /// names loaded.
    pub async fn warm_from_disk(&self) -> usize {
        let Some(disk) = &self.disk else {
            return 0;
        };
        let cached = match disk.load_locations() {
            Ok(Some(cached)) if !cached.is_stale() => cached,
            Ok(Some(_)) => {
                debug!("Location snapshot is stale, not warming");
                return 0;
            }
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Failed to read location snapshot");
                return 0;
            }
        };

        let mut names = self.names.write().await;
        for location in &cached.data {
            names.insert(location.id.clone(), location.site_name.clone());
        }
        debug!(count = cached.data.len(), age = %cached.age_display(), "Warmed location names from disk");
        cached.data.len()
    }

    /// Fetch every location and replace the cached names. An empty or
    /// failed fetch keeps what is already cached.
    pub async fn prefetch(&self) -> usize {
        let locations = match self.source.fetch_all().await {
            Ok(locations) => locations,
            Err(e) => {
                warn!(error = %e, "Failed to prefetch locations");
                return 0;
            }
        };
        if locations.is_empty() {
            warn!("API returned empty location list");
            return 0;
        }

        {
            let mut names = self.names.write().await;
            names.clear();
            for location in &locations {
                names.insert(location.id.clone(), location.site_name.clone());
            }
        }

        if let Some(disk) = &self.disk {
            if let Err(e) = disk.save_locations(&locations) {
                warn!(error = %e, "Failed to save location snapshot");
            }
        }

        info!(count = locations.len(), "Prefetched location names");
        locations.len()
    }

    /// Display name for a location id.
    pub async fn name_for(&self, id: &str) -> String {
        if let Some(name) = self.names.read().await.get(id) {
            debug!(id, name = %name, "Location name cache hit");
            return name.clone();
        }

        match self.source.fetch_one(id).await {
            Ok(location) => return self.remember(id, location.site_name).await,
            Err(e) => debug!(id, error = %e, "Single location fetch failed"),
        }

        match self.source.fetch_all().await {
            Ok(locations) => {
                if let Some(location) = locations.into_iter().find(|l| l.id == id) {
                    return self.remember(id, location.site_name).await;
                }
            }
            Err(e) => debug!(id, error = %e, "Location list fetch failed"),
        }

        let fallback = fallback_name(id);
        debug!(id, fallback = %fallback, "Using fallback location name");
        fallback
    }

    async fn remember(&self, id: &str, name: String) -> String {
        self.names
            .write()
            .await
            .insert(id.to_string(), name.clone());
        name
    }
}

/// Name shown when a location cannot be resolved.
///
/// Ids shaped like `loc-north-depot` become "North Depot".
pub fn fallback_name(id: &str) -> String {
    if id.is_empty() {
        return "No location specified".to_string();
    }

    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() > 1 {
        return parts[1..]
            .iter()
            .map(|word| capitalize(word))
            .collect::<Vec<_>>()
            .join(" ");
    }

    "Garbage Collection Point".to_string()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
