use super::check_response_status;
use anyhow::{Context, Result};
use atlas::entity::LocationData;
use reqwest::Client;
use serde::Deserialize;

pub const API: &str = "nominatim";

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    #[serde(default)]
    address: Option<Address>,
    /// Set instead of a result when nothing is at the point (open sea, etc.)
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    neighbourhood: Option<String>,
    suburb: Option<String>,
    village: Option<String>,
    town: Option<String>,
    city: Option<String>,
    country: Option<String>,
}

impl Address {
    /// Most specific populated place name.
    fn locality(&self) -> Option<String> {
        [
            &self.suburb,
            &self.neighbourhood,
            &self.village,
            &self.town,
            &self.city,
        ]
        .into_iter()
        .find_map(|v| v.clone())
    }
}

/// Reverse geocoding client (Nominatim `/reverse`).
pub struct NominatimClient {
    http_client: Client,
    base_url: String,
}

impl NominatimClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<Option<LocationData>> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("zoom", "16".to_string()),
            ])
            .send()
            .await
            .context("Failed to send reverse geocode request")?;

        check_response_status(API, &response)?;
        let body: ReverseResponse = response
            .json()
            .await
            .context("Failed to parse reverse geocode response")?;

        if body.error.is_some() {
            return Ok(None);
        }
        let Some(display_name) = body.display_name else {
            return Ok(None);
        };

        let address = body.address.unwrap_or_default();
        Ok(Some(LocationData {
            display_name,
            locality: address.locality(),
            country: address.country,
        }))
    }
}
