use super::check_response_status;
use anyhow::{Context, Result};
use atlas::entity::PrayerData;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const API: &str = "aladhan";

/// Timings kept from the response; the rest (Imsak, Midnight, ...) are dropped.
const PRAYERS: [&str; 6] = ["Fajr", "Sunrise", "Dhuhr", "Asr", "Maghrib", "Isha"];

#[derive(Debug, Deserialize)]
struct TimingsResponse {
    code: u16,
    data: Option<TimingsData>,
}

#[derive(Debug, Deserialize)]
struct TimingsData {
    timings: BTreeMap<String, String>,
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    method: Option<Method>,
}

#[derive(Debug, Deserialize)]
struct Method {
    name: Option<String>,
}

/// Daily prayer times (Aladhan `/v1/timings`).
pub struct AladhanClient {
    http_client: Client,
    base_url: String,
    method: u8,
}

impl AladhanClient {
    pub fn new(http_client: Client, base_url: &str, method: u8) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            method,
        }
    }

    pub async fn timings(&self, lat: f64, lon: f64, date: NaiveDate) -> Result<Option<PrayerData>> {
        let url = format!("{}/v1/timings/{}", self.base_url, date.format("%d-%m-%Y"));
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("method", self.method.to_string()),
            ])
            .send()
            .await
            .context("Failed to send prayer times request")?;

        check_response_status(API, &response)?;
        let body: TimingsResponse = response
            .json()
            .await
            .context("Failed to parse prayer times response")?;

        if body.code != 200 {
            return Ok(None);
        }
        let Some(data) = body.data else {
            return Ok(None);
        };

        let timings: BTreeMap<String, String> = data
            .timings
            .into_iter()
            .filter(|(name, _)| PRAYERS.contains(&name.as_str()))
            // Some methods append a timezone suffix, e.g. "05:12 (GMT)"
            .map(|(name, time)| {
                let time = time.split_whitespace().next().unwrap_or_default().to_string();
                (name, time)
            })
            .collect();

        if timings.is_empty() {
            return Ok(None);
        }

        Ok(Some(PrayerData {
            date: date.format("%Y-%m-%d").to_string(),
            timings,
            method: data.meta.and_then(|m| m.method).and_then(|m| m.name),
        }))
    }
}
