use super::check_response_status;
use crate::geo::PoiResult;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const API: &str = "overpass";

/// Upper bound on elements per query.
const MAX_RESULTS: usize = 100;

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    lat: Option<f64>,
    lon: Option<f64>,
    /// Ways and relations carry a centre instead of a position
    center: Option<Center>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Center {
    lat: f64,
    lon: f64,
}

/// POI search client (Overpass `/api/interpreter`).
pub struct OverpassClient {
    http_client: Client,
    base_url: String,
}

impl OverpassClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Elements tagged `key` or `key=value` around a point.
    pub async fn search_by_tag(&self, lat: f64, lon: f64, radius_m: f64, tag: &str) -> Result<Vec<PoiResult>> {
        let (key, value) = match tag.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (tag.trim(), None),
        };
        let selector = match value {
            Some(v) => format!("[\"{}\"=\"{}\"][\"name\"]", escape(key), escape(v)),
            None => format!("[\"{}\"][\"name\"]", escape(key)),
        };

        let elements = self.run(&around_query(&selector, lat, lon, radius_m)).await?;
        Ok(to_pois(elements, key))
    }

    /// Named elements whose name contains `name` (case-insensitive).
    pub async fn search_by_name(&self, lat: f64, lon: f64, radius_m: f64, name: &str) -> Result<Vec<PoiResult>> {
        let selector = format!("[\"name\"~\"{}\",i]", escape(&regex_escape(name)));
        let elements = self.run(&around_query(&selector, lat, lon, radius_m)).await?;
        Ok(to_pois(elements, "amenity"))
    }

    async fn run(&self, query: &str) -> Result<Vec<Element>> {
        let url = format!("{}/api/interpreter", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .form(&[("data", query)])
            .send()
            .await
            .context("Failed to send Overpass query")?;

        check_response_status(API, &response)?;
        let body: OverpassResponse = response
            .json()
            .await
            .context("Failed to parse Overpass response")?;
        Ok(body.elements)
    }
}

fn around_query(selector: &str, lat: f64, lon: f64, radius_m: f64) -> String {
    let around = format!("(around:{:.0},{:.6},{:.6})", radius_m, lat, lon);
    format!(
        "[out:json][timeout:25];(node{sel}{around};way{sel}{around};);out center {max};",
        sel = selector,
        around = around,
        max = MAX_RESULTS
    )
}

/// Elements with a name and a position, categorised by `category_key`.
fn to_pois(elements: Vec<Element>, category_key: &str) -> Vec<PoiResult> {
    elements
        .into_iter()
        .filter_map(|mut e| {
            let (lat, lon) = match (e.lat, e.lon, &e.center) {
                (Some(lat), Some(lon), _) => (lat, lon),
                (_, _, Some(c)) => (c.lat, c.lon),
                _ => return None,
            };
            let name = e.tags.remove("name")?;
            let category = e
                .tags
                .get(category_key)
                .or_else(|| e.tags.get("amenity"))
                .or_else(|| e.tags.get("shop"))
                .or_else(|| e.tags.get("leisure"))
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let address = match (e.tags.get("addr:housenumber"), e.tags.get("addr:street")) {
                (Some(n), Some(s)) => Some(format!("{} {}", n, s)),
                (None, Some(s)) => Some(s.clone()),
                _ => None,
            };

            Some(PoiResult {
                poi_id: format!("{}/{}", e.kind, e.id),
                name,
                lat,
                lon,
                category,
                tags: e.tags,
                address,
            })
        })
        .collect()
}

/// Escape for an Overpass QL double-quoted string.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
