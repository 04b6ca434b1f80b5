use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::{error::ProviderError, model::WeatherSnapshot};

use super::{WeatherProvider, http_client, truncate_body};

const NAME: &str = "openweather";
const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
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
struct OwMain {
    temp: f64,
    feels_like: f64,
    humidity: u8,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    main: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    name: String,
    dt: i64,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
}

impl OwCurrentResponse {
    fn into_snapshot(self) -> WeatherSnapshot {
        let observed_at = DateTime::<Utc>::from_timestamp(self.dt, 0).unwrap_or_else(Utc::now);
        let (main, description) = self
            .weather
            .into_iter()
            .next()
            .map(|w| (w.main, w.description))
            .unwrap_or_else(|| ("Unknown".to_string(), "Unknown".to_string()));

        WeatherSnapshot {
            city: self.name,
            temperature_c: self.main.temp,
            feels_like_c: self.main.feels_like,
            humidity_pct: self.main.humidity,
            main,
            description,
            observed_at,
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn current(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        let url = format!("{}/data/2.5/weather", self.base_url);
        debug!(provider = NAME, city, "fetching current weather");

        let res = self
            .http
            .get(&url)
            .query(&[
                ("q", city),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
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

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::CityNotFound(city.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: NAME,
                status,
                body: truncate_body(&body),
            });
        }

        let parsed: OwCurrentResponse =
            serde_json::from_str(&body).map_err(|source| ProviderError::Decode {
                provider: NAME,
                source,
            })?;

        Ok(parsed.into_snapshot())
    }
}
