//! HTTP clients for the geo content APIs.
//!
//! Each submodule wraps one upstream and knows nothing about throttling;
//! [`HttpGeoApi`] composes them behind the [`GeoApi`] trait and sends every
//! request through the shared [`CallGovernor`] under the API's name.

pub mod aladhan;
pub mod nominatim;
pub mod open_meteo;
pub mod osrm;
pub mod overpass;
pub mod tfl;

use crate::geo::{GeoApi, PoiResult, Route, StopArrivals, TransitMode};
use anyhow::{Context, Result};
use async_trait::async_trait;
use atlas::config::ApisConfig;
use atlas::entity::{DisruptionData, LocationData, PrayerData, WeatherData};
use atlas::rate_limit::{CallError, CallGovernor};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Map an upstream status to the governor's error types.
///
/// - 429 → [`CallError::RateLimited`]
/// - Other non-2xx → [`CallError::Status`]
pub(crate) fn check_response_status(api: &str, response: &reqwest::Response) -> Result<()> {
    match response.status() {
        StatusCode::TOO_MANY_REQUESTS => Err(CallError::RateLimited {
            api: api.to_string(),
        }
        .into()),
        s if !s.is_success() => Err(CallError::Status {
            api: api.to_string(),
            status: s.as_u16(),
        }
        .into()),
        _ => Ok(()),
    }
}

pub(crate) fn build_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .context("Failed to build HTTP client")
}

/// [`GeoApi`] over the public HTTP endpoints.
pub struct HttpGeoApi {
    governor: Arc<CallGovernor>,
    nominatim: nominatim::NominatimClient,
    overpass: overpass::OverpassClient,
    osrm: osrm::OsrmClient,
    open_meteo: open_meteo::OpenMeteoClient,
    aladhan: aladhan::AladhanClient,
    tfl: tfl::TflClient,
}

impl HttpGeoApi {
    pub fn new(config: &ApisConfig, governor: Arc<CallGovernor>) -> Result<Self> {
        let client = build_client(&config.user_agent)?;
        Ok(Self {
            governor,
            nominatim: nominatim::NominatimClient::new(client.clone(), &config.nominatim_url),
            overpass: overpass::OverpassClient::new(client.clone(), &config.overpass_url),
            osrm: osrm::OsrmClient::new(client.clone(), &config.osrm_url),
            open_meteo: open_meteo::OpenMeteoClient::new(client.clone(), &config.open_meteo_url),
            aladhan: aladhan::AladhanClient::new(
                client.clone(),
                &config.aladhan_url,
                config.prayer_method,
            ),
            tfl: tfl::TflClient::new(client, &config.tfl_url, config.tfl_app_key.clone()),
        })
    }
}

#[async_trait]
impl GeoApi for HttpGeoApi {
    async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<Option<LocationData>> {
        self.governor
            .call(nominatim::API, || self.nominatim.reverse(lat, lon))
            .await
    }

    async fn search_pois(&self, lat: f64, lon: f64, radius_m: f64, tag: &str) -> Result<Vec<PoiResult>> {
        self.governor
            .call(overpass::API, || self.overpass.search_by_tag(lat, lon, radius_m, tag))
            .await
    }

    async fn search_by_name(&self, lat: f64, lon: f64, radius_m: f64, name: &str) -> Result<Vec<PoiResult>> {
        self.governor
            .call(overpass::API, || self.overpass.search_by_name(lat, lon, radius_m, name))
            .await
    }

    async fn walking_route(&self, from: (f64, f64), to: (f64, f64)) -> Result<Option<Route>> {
        self.governor
            .call(osrm::API, || self.osrm.walking_route(from, to))
            .await
    }

    async fn current_weather(&self, lat: f64, lon: f64) -> Result<Option<WeatherData>> {
        self.governor
            .call(open_meteo::API, || self.open_meteo.current(lat, lon))
            .await
    }

    async fn prayer_times(&self, lat: f64, lon: f64) -> Result<Option<PrayerData>> {
        let today = chrono::Utc::now().date_naive();
        self.governor
            .call(aladhan::API, || self.aladhan.timings(lat, lon, today))
            .await
    }

    async fn transit_arrivals(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        mode: TransitMode,
    ) -> Result<Vec<StopArrivals>> {
        let stops = self
            .governor
            .call(tfl::API, || self.tfl.stops_near(lat, lon, radius_m, mode))
            .await?;

        let mut results = Vec::with_capacity(stops.len());
        for stop in stops {
            let arrivals = self
                .governor
                .call(tfl::API, || self.tfl.arrivals(&stop.id))
                .await?;
            debug!(stop_id = %stop.id, count = arrivals.len(), "Fetched stop arrivals");
            results.push(StopArrivals {
                stop_id: stop.id,
                stop_name: stop.name,
                lat: stop.lat,
                lon: stop.lon,
                mode,
                arrivals,
            });
        }
        Ok(results)
    }

    async fn line_disruptions(&self, mode: TransitMode) -> Result<Vec<DisruptionData>> {
        self.governor
            .call(tfl::API, || self.tfl.line_status(mode))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas::rate_limit::GovernorConfig;
    use mockito::{Matcher, Server};
    use std::collections::HashMap;

    fn governor() -> Arc<CallGovernor> {
        Arc::new(CallGovernor::new(GovernorConfig {
            default_interval_ms: 0,
            intervals_ms: HashMap::new(),
            call_timeout_seconds: 5,
            max_backoff_seconds: 60,
        }))
    }

    #[tokio::test]
    async fn test_rate_limit_reaches_governor() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/reverse")
            .match_query(Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let config = ApisConfig {
            nominatim_url: server.url(),
            ..Default::default()
        };
        let governor = governor();
        let api = HttpGeoApi::new(&config, governor.clone()).unwrap();

        let err = api.reverse_geocode(51.41, -0.30).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CallError>(),
            Some(CallError::RateLimited { .. })
        ));

        let stats = governor.stats();
        assert_eq!(stats[nominatim::API].rate_limit_hits, 1);
        assert_eq!(stats[nominatim::API].consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_transit_arrivals_combines_stop_and_arrival_calls() {
        let mut server = Server::new_async().await;
        let _stops = server
            .mock("GET", "/StopPoint")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"stopPoints": [
                    {"naptanId": "490G00012345", "commonName": "Kingston Hall Road", "lat": 51.41, "lon": -0.30, "distance": 40.0}
                ]}"#,
            )
            .create_async()
            .await;
        let _arrivals = server
            .mock("GET", "/StopPoint/490G00012345/Arrivals")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"lineName": "71", "destinationName": "Richmond", "timeToStation": 420, "expectedArrival": "2026-02-17T12:07:00Z"},
                    {"lineName": "K2", "destinationName": "Hook", "timeToStation": 60, "expectedArrival": "2026-02-17T12:01:00Z"}
                ]"#,
            )
            .create_async()
            .await;

        let config = ApisConfig {
            tfl_url: server.url(),
            ..Default::default()
        };
        let governor = governor();
        let api = HttpGeoApi::new(&config, governor.clone()).unwrap();

        let stops = api
            .transit_arrivals(51.41, -0.30, 500.0, TransitMode::Bus)
            .await
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].arrivals[0].line, "K2");
        assert_eq!(stops[0].arrivals[0].minutes, 1);
        assert_eq!(governor.stats()[tfl::API].calls, 2);
    }
}
