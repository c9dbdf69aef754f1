use super::check_response_status;
use crate::geo::TransitMode;
use anyhow::{Context, Result};
use atlas::entity::{Arrival, DisruptionData};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

pub const API: &str = "tfl";

/// Stops queried per mode around a point.
const MAX_STOPS: usize = 3;

/// Departures kept per stop.
const MAX_ARRIVALS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopPointsResponse {
    #[serde(default)]
    stop_points: Vec<StopPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopPoint {
    naptan_id: String,
    common_name: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    distance: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TflArrival {
    line_name: String,
    #[serde(default)]
    destination_name: String,
    time_to_station: i64,
    expected_arrival: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Line {
    name: String,
    #[serde(default)]
    line_statuses: Vec<LineStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineStatus {
    status_severity: u8,
    status_severity_description: String,
    reason: Option<String>,
}

/// TfL status severity for "Good Service".
const GOOD_SERVICE: u8 = 10;

fn stop_types(mode: TransitMode) -> &'static str {
    match mode {
        TransitMode::Bus => "NaptanPublicBusCoachTram",
        TransitMode::Tube => "NaptanMetroStation",
        TransitMode::Rail => "NaptanRailStation",
    }
}

fn tfl_modes(mode: TransitMode) -> &'static str {
    match mode {
        TransitMode::Bus => "bus",
        TransitMode::Tube => "tube",
        TransitMode::Rail => "national-rail,overground,elizabeth-line",
    }
}

/// London transit client (TfL unified API).
pub struct TflClient {
    http_client: Client,
    base_url: String,
    app_key: Option<String>,
}

impl TflClient {
    pub fn new(http_client: Client, base_url: &str, app_key: Option<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_key,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.http_client.get(format!("{}{}", self.base_url, path));
        match &self.app_key {
            Some(key) => request.query(&[("app_key", key)]),
            None => request,
        }
    }

    /// Closest stops of a mode around a point.
    pub async fn stops_near(&self, lat: f64, lon: f64, radius_m: f64, mode: TransitMode) -> Result<Vec<Stop>> {
        let response = self
            .get("/StopPoint")
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("stopTypes", stop_types(mode).to_string()),
                ("radius", format!("{:.0}", radius_m)),
                ("modes", tfl_modes(mode).to_string()),
            ])
            .send()
            .await
            .context("Failed to send stop search request")?;

        check_response_status(API, &response)?;
        let body: StopPointsResponse = response
            .json()
            .await
            .context("Failed to parse stop search response")?;

        let mut stops = body.stop_points;
        stops.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(stops
            .into_iter()
            .take(MAX_STOPS)
            .map(|s| Stop {
                id: s.naptan_id,
                name: s.common_name,
                lat: s.lat,
                lon: s.lon,
            })
            .collect())
    }

    /// Next departures at a stop, soonest first.
    pub async fn arrivals(&self, stop_id: &str) -> Result<Vec<Arrival>> {
        let path = format!("/StopPoint/{}/Arrivals", urlencoding::encode(stop_id));
        let response = self
            .get(&path)
            .send()
            .await
            .context("Failed to send arrivals request")?;

        check_response_status(API, &response)?;
        let mut arrivals: Vec<TflArrival> = response
            .json()
            .await
            .context("Failed to parse arrivals response")?;

        arrivals.sort_by_key(|a| a.time_to_station);
        Ok(arrivals
            .into_iter()
            .take(MAX_ARRIVALS)
            .map(|a| Arrival {
                line: a.line_name,
                destination: a.destination_name,
                minutes: (a.time_to_station.max(0) / 60) as u32,
                expected_at: a.expected_arrival,
            })
            .collect())
    }

    /// Lines of a mode not running a good service.
    pub async fn line_status(&self, mode: TransitMode) -> Result<Vec<DisruptionData>> {
        let path = format!("/Line/Mode/{}/Status", tfl_modes(mode));
        let response = self
            .get(&path)
            .send()
            .await
            .context("Failed to send line status request")?;

        check_response_status(API, &response)?;
        let lines: Vec<Line> = response
            .json()
            .await
            .context("Failed to parse line status response")?;

        Ok(lines
            .into_iter()
            .filter_map(|line| {
                let status = line
                    .line_statuses
                    .into_iter()
                    .filter(|s| s.status_severity != GOOD_SERVICE)
                    .min_by_key(|s| s.status_severity)?;
                Some(DisruptionData {
                    line: line.name,
                    severity: status.status_severity_description,
                    description: status.reason.unwrap_or_default(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_stops_sorted_and_capped() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/StopPoint")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("stopTypes".into(), "NaptanMetroStation".into()),
                Matcher::UrlEncoded("radius".into(), "500".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"stopPoints": [
                    {"naptanId": "D", "commonName": "Far", "lat": 51.0, "lon": 0.0, "distance": 480.0},
                    {"naptanId": "A", "commonName": "Near", "lat": 51.0, "lon": 0.0, "distance": 20.0},
                    {"naptanId": "C", "commonName": "Mid", "lat": 51.0, "lon": 0.0, "distance": 300.0},
                    {"naptanId": "B", "commonName": "Close", "lat": 51.0, "lon": 0.0, "distance": 90.0}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TflClient::new(Client::new(), &server.url(), None);
        let stops = client
            .stops_near(51.0, 0.0, 500.0, TransitMode::Tube)
            .await
            .unwrap();
        let ids: Vec<&str> = stops.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_app_key_sent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/StopPoint/940GZZLUKSX/Arrivals")
            .match_query(Matcher::UrlEncoded("app_key".into(), "secret".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client = TflClient::new(Client::new(), &server.url(), Some("secret".to_string()));
        let arrivals = client.arrivals("940GZZLUKSX").await.unwrap();
        assert!(arrivals.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_line_status_skips_good_service() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/Line/Mode/tube/Status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"name": "Victoria", "lineStatuses": [{"statusSeverity": 10, "statusSeverityDescription": "Good Service"}]},
                    {"name": "District", "lineStatuses": [{"statusSeverity": 6, "statusSeverityDescription": "Severe Delays", "reason": "Signal failure at Earl's Court"}]}
                ]"#,
            )
            .create_async()
            .await;

        let client = TflClient::new(Client::new(), &server.url(), None);
        let disruptions = client.line_status(TransitMode::Tube).await.unwrap();
        assert_eq!(disruptions.len(), 1);
        assert_eq!(disruptions[0].line, "District");
        assert!(disruptions[0].is_severe());
    }
}
