use serde::{Deserialize, Serialize};

/// A garbage pickup site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PickupLocation {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "siteName", default)]
    pub site_name: String,
    #[serde(rename = "wasteType", default)]
    pub waste_type: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
}

/// Envelope used by both the list and the single-location endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PickupLocationResponse {
    #[serde(default)]
    pub locations: Option<Vec<PickupLocation>>,
    #[serde(default)]
    pub location: Option<PickupLocation>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
