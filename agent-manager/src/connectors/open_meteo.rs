use super::check_response_status;
use anyhow::{Context, Result};
use atlas::entity::WeatherData;
use reqwest::Client;
use serde::Deserialize;

pub const API: &str = "open_meteo";

const CURRENT_FIELDS: &str =
    "temperature_2m,apparent_temperature,precipitation,weather_code,wind_speed_10m";

/// Wind speed treated as a warning (km/h).
const HIGH_WIND_KMH: f64 = 60.0;

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: Option<Current>,
}

#[derive(Debug, Deserialize)]
struct Current {
    temperature_2m: f64,
    apparent_temperature: Option<f64>,
    #[serde(default)]
    precipitation: f64,
    weather_code: Option<u16>,
    #[serde(default)]
    wind_speed_10m: f64,
}

/// Current conditions (Open-Meteo `/v1/forecast`).
pub struct OpenMeteoClient {
    http_client: Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(http_client: Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn current(&self, lat: f64, lon: f64) -> Result<Option<WeatherData>> {
        let url = format!("{}/v1/forecast", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
            ])
            .send()
            .await
            .context("Failed to send weather request")?;

        check_response_status(API, &response)?;
        let body: ForecastResponse = response
            .json()
            .await
            .context("Failed to parse weather response")?;

        Ok(body.current.map(|c| {
            let code = c.weather_code.unwrap_or(0);
            WeatherData {
                temperature_c: c.temperature_2m,
                feels_like_c: c.apparent_temperature,
                condition: condition_for(code).to_string(),
                weather_code: c.weather_code,
                precipitation_mm: c.precipitation,
                wind_speed_kmh: c.wind_speed_10m,
                warning: warning_for(code, c.wind_speed_10m),
            }
        }))
    }
}

/// WMO weather interpretation code to a short description.
pub fn condition_for(code: u16) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 | 48 => "Fog",
        51 | 53 | 55 => "Drizzle",
        56 | 57 => "Freezing drizzle",
        61 => "Light rain",
        63 => "Rain",
        65 => "Heavy rain",
        66 | 67 => "Freezing rain",
        71 => "Light snow",
        73 => "Snow",
        75 => "Heavy snow",
        77 => "Snow grains",
        80 | 81 => "Rain showers",
        82 => "Violent rain showers",
        85 | 86 => "Snow showers",
        95 => "Thunderstorm",
        96 | 99 => "Thunderstorm with hail",
        _ => "Unknown",
    }
}

fn warning_for(code: u16, wind_speed_kmh: f64) -> Option<String> {
    let warning = match code {
        95..=99 => Some("Thunderstorm"),
        65 | 67 | 82 => Some("Heavy rain"),
        75 | 86 => Some("Heavy snow"),
        56 | 57 | 66 => Some("Freezing conditions"),
        _ if wind_speed_kmh >= HIGH_WIND_KMH => Some("High winds"),
        _ => None,
    };
    warning.map(str::to_string)
}
