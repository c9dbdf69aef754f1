use super::check_response_status;
use crate::geo::Route;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;

pub const API: &str = "osrm";

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// GeoJSON order: `[lon, lat]`
    coordinates: Vec<[f64; 2]>,
}

/// Walking directions (OSRM `route/v1/foot`).
pub struct OsrmClient {
    http_client: Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Route between two `(lat, lon)` points; `None` when no route exists.
    pub async fn walking_route(&self, from: (f64, f64), to: (f64, f64)) -> Result<Option<Route>> {
        let url = format!(
            "{}/route/v1/foot/{:.6},{:.6};{:.6},{:.6}",
            self.base_url, from.1, from.0, to.1, to.0
        );
        let response = self
            .http_client
            .get(&url)
            .query(&[("overview", "full"), ("geometries", "geojson")])
            .send()
            .await
            .context("Failed to send route request")?;

        // OSRM answers 400 with a JSON code for unroutable points
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: RouteResponse = response
                .json()
                .await
                .context("Failed to parse route error response")?;
            return match body.code.as_str() {
                "NoRoute" | "NoSegment" => Ok(None),
                code => anyhow::bail!("osrm rejected route request: {}", code),
            };
        }

        check_response_status(API, &response)?;
        let body: RouteResponse = response
            .json()
            .await
            .context("Failed to parse route response")?;

        if body.code != "Ok" {
            return Ok(None);
        }
        let Some(route) = body.routes.into_iter().next() else {
            return Ok(None);
        };

        Ok(Some(Route {
            points: route
                .geometry
                .coordinates
                .into_iter()
                .map(|[lon, lat]| [lat, lon])
                .collect(),
            distance_m: route.distance,
            duration_s: route.duration,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_route_swaps_coordinates() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/route/v1/foot/-0.300000,51.410000;-0.290000,51.420000")
            .match_query(Matcher::UrlEncoded("geometries".into(), "geojson".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"code": "Ok", "routes": [{
                    "distance": 1320.5, "duration": 950.0,
                    "geometry": {"type": "LineString", "coordinates": [[-0.3, 51.41], [-0.295, 51.415], [-0.29, 51.42]]}
                }]}"#,
            )
            .create_async()
            .await;

        let client = OsrmClient::new(Client::new(), &server.url());
        let route = client
            .walking_route((51.41, -0.30), (51.42, -0.29))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(route.points.len(), 3);
        assert_eq!(route.points[0], [51.41, -0.3]);
        assert_eq!(route.points[2], [51.42, -0.29]);
        assert_eq!(route.distance_m, 1320.5);
    }

    #[tokio::test]
    async fn test_no_route() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", Matcher::Regex("^/route/v1/foot/".to_string()))
            .match_query(Matcher::Any)
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code": "NoRoute", "message": "Impossible route between points"}"#)
            .create_async()
            .await;

        let client = OsrmClient::new(Client::new(), &server.url());
        let route = client
            .walking_route((51.41, -0.30), (48.85, 2.35))
            .await
            .unwrap();
        assert!(route.is_none());
    }
}
