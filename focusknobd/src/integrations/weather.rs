//! OpenWeatherMap current conditions plus the next 24 hours.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, TimeZone, Timelike};
use focusknob_common::settings::WeatherCredentials;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{check_status, truncate, Feed, IntegrationError, WEATHER};

const SERVICE: &str = "OpenWeatherMap";
const BASE_URL: &str = "https://api.openweathermap.org/data/2.5";
const PERIOD: Duration = Duration::from_secs(900);
/// Eight 3-hour steps.
const FORECAST_STEPS: &str = "8";

pub struct WeatherClient {
    http: reqwest::Client,
    creds: WeatherCredentials,
}

impl WeatherClient {
    pub fn new(http: reqwest::Client, creds: WeatherCredentials) -> Self {
        Self { http, creds }
    }

    async fn call(&self, endpoint: &str, extra: &[(&str, &str)]) -> Result<Value, IntegrationError> {
        let response = self
            .http
            .get(format!("{BASE_URL}/{endpoint}"))
            .query(&[
                ("q", self.creds.location.as_str()),
                ("appid", self.creds.api_key.as_str()),
                ("units", "imperial"),
            ])
            .query(extra)
            .send()
            .await?;
        Ok(check_status(SERVICE, response).await?.json().await?)
    }
}

#[async_trait]
impl Feed for WeatherClient {
    fn command(&self) -> &'static str {
        WEATHER
    }

    fn period(&self) -> Option<Duration> {
        Some(PERIOD)
    }

    async fn fetch(&self) -> Result<Value, IntegrationError> {
        let current = current_conditions(&self.call("weather", &[]).await?)?;
        let mut data = json!({ "current": current });

        // The forecast is a bonus; current conditions alone are still worth sending.
        match self.call("forecast", &[("cnt", FORECAST_STEPS)]).await {
            Ok(raw) => {
                let forecast = forecast_entries(&raw);
                info!("Fetched {} forecast entries", forecast.len());
                if !forecast.is_empty() {
                    data["forecast"] = Value::Array(forecast);
                }
            }
            Err(e) => warn!("Forecast fetch failed: {}", e),
        }
        Ok(data)
    }
}

fn rounded(v: &Value) -> Option<i64> {
    v.as_f64().map(|f| f.round() as i64)
}

fn current_conditions(raw: &Value) -> Result<Value, IntegrationError> {
    let main = &raw["main"];
    let temp = rounded(&main["temp"])
        .ok_or_else(|| IntegrationError::Payload("weather response has no temperature".into()))?;
    let weather = &raw["weather"][0];
    Ok(json!({
        "temp": temp,
        "temp_min": rounded(&main["temp_min"]).unwrap_or(temp),
        "temp_max": rounded(&main["temp_max"]).unwrap_or(temp),
        "humidity": main["humidity"].as_i64().unwrap_or(0),
        "wind_speed": rounded(&raw["wind"]["speed"]).unwrap_or(0),
        "condition_id": weather["id"].as_i64().unwrap_or(800),
        "condition": truncate(weather["main"].as_str().unwrap_or("Unknown"), 31, 28),
        "description": truncate(weather["description"].as_str().unwrap_or_default(), 47, 44),
    }))
}

fn forecast_entries(raw: &Value) -> Vec<Value> {
    let Some(list) = raw["list"].as_array() else {
        return Vec::new();
    };
    list.iter()
        .map(|entry| {
            let weather = &entry["weather"][0];
            let hour = entry["dt"]
                .as_i64()
                .and_then(|dt| Local.timestamp_opt(dt, 0).single())
                .map(|t| t.hour())
                .unwrap_or(0);
            json!({
                "temp": rounded(&entry["main"]["temp"]).unwrap_or(0),
                "condition_id": weather["id"].as_i64().unwrap_or(800),
                "hour_str": hour_label(hour),
                "description": truncate(weather["description"].as_str().unwrap_or_default(), 47, 44),
            })
        })
        .collect()
}

/// `0 -> 12am`, `13 -> 1pm`.
pub fn hour_label(hour: u32) -> String {
    match hour {
        0 => "12am".to_string(),
        1..=11 => format!("{hour}am"),
        12 => "12pm".to_string(),
        _ => format!("{}pm", hour - 12),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_conditions_are_rounded_and_defaulted() {
        let raw = json!({
            "main": {"temp": 71.6, "humidity": 40},
            "wind": {"speed": 4.4},
            "weather": [{"id": 500, "main": "Rain", "description": "light rain"}]
        });
        let current = current_conditions(&raw).unwrap();
        assert_eq!(current["temp"], 72);
        assert_eq!(current["temp_min"], 72);
        assert_eq!(current["wind_speed"], 4);
        assert_eq!(current["condition"], "Rain");
        assert_eq!(current["condition_id"], 500);

        assert!(current_conditions(&json!({"cod": 401})).is_err());
    }

    #[test]
    fn hour_labels() {
        assert_eq!(hour_label(0), "12am");
        assert_eq!(hour_label(9), "9am");
        assert_eq!(hour_label(12), "12pm");
        assert_eq!(hour_label(21), "9pm");
    }

    #[test]
    fn forecast_tolerates_missing_fields() {
        let raw = json!({"list": [{"dt": 0, "main": {}, "weather": []}]});
        let entries = forecast_entries(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["condition_id"], 800);
        assert_eq!(entries[0]["temp"], 0);
        assert!(forecast_entries(&json!({})).is_empty());
    }
}
