use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::{error::ProviderError, model::WeatherSnapshot};

use super::{WeatherProvider, http_client, truncate_body};

const NAME: &str = "weatherapi";
const DEFAULT_BASE_URL: &str = "http://api.weatherapi.com";

/// WeatherAPI.com error code for "No location found matching parameter q".
const NO_MATCHING_LOCATION: i64 = 1006;

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WeatherApiProvider {
    pub fn new(api_key: String, timeout: Duration) -> Self {
        Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: http_client(timeout),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    name: String,
    localtime_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaCondition {
    text: String,
    code: i64,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    temp_c: f64,
    feelslike_c: f64,
    humidity: u8,
    condition: WaCondition,
    last_updated_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    location: WaLocation,
    current: WaCurrent,
}

#[derive(Debug, Deserialize)]
struct WaErrorBody {
    error: WaError,
}

#[derive(Debug, Deserialize)]
struct WaError {
    code: i64,
}

impl WaResponse {
    fn into_snapshot(self) -> WeatherSnapshot {
        let observed_at = self
            .current
            .last_updated_epoch
            .or(self.location.localtime_epoch)
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);

        let main = category_for_code(self.current.condition.code)
            .map(str::to_string)
            .unwrap_or_else(|| self.current.condition.text.clone());

        WeatherSnapshot {
            city: self.location.name,
            temperature_c: self.current.temp_c,
            feels_like_c: self.current.feelslike_c,
            humidity_pct: self.current.humidity,
            main,
            description: self.current.condition.text,
            observed_at,
        }
    }
}

/// Map WeatherAPI condition codes onto the OpenWeather "main" groups so that
/// `main:` conditions mean the same thing for both providers.
fn category_for_code(code: i64) -> Option<&'static str> {
    let category = match code {
        1000 => "Clear",
        1003 | 1006 | 1009 => "Clouds",
        1030 => "Mist",
        1135 | 1147 => "Fog",
        1072 | 1150 | 1153 | 1168 | 1171 => "Drizzle",
        1063 | 1180..=1201 | 1240..=1246 => "Rain",
        1066 | 1069 | 1114 | 1117 | 1204..=1237 | 1249..=1264 => "Snow",
        1087 | 1273..=1282 => "Thunderstorm",
        _ => return None,
    };
    Some(category)
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    async fn current(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        let url = format!("{}/v1/current.json", self.base_url);
        debug!(provider = NAME, city, "fetching current weather");

        let res = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("q", city)])
            .send()
            .await
            .map_err(|source| ProviderError::Request {
                provider: NAME,
                source,
            })?;

        let status = res.status();
        let body = res.text().await.map_err(|source| ProviderError::Request {
            provider: NAME,
            source,
        })?;

        if status == StatusCode::BAD_REQUEST {
            let not_found = serde_json::from_str::<WaErrorBody>(&body)
                .map(|b| b.error.code == NO_MATCHING_LOCATION)
                .unwrap_or(false);
            if not_found {
                return Err(ProviderError::CityNotFound(city.to_string()));
            }
        }
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: NAME,
                status,
                body: truncate_body(&body),
            });
        }

        let parsed: WaResponse =
            serde_json::from_str(&body).map_err(|source| ProviderError::Decode {
                provider: NAME,
                source,
            })?;

        Ok(parsed.into_snapshot())
    }
}
