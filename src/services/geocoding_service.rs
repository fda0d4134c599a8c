// src/services/geocoding_service.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::ride::Coordinate,
};

pub const DEFAULT_GEOCODING_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Coordinate to display address. Only ever used for display, so callers
/// treat failures as "no address".
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn address_for(&self, location: Coordinate) -> DispatchResult<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    formatted_address: String,
}

pub struct GoogleReverseGeocoder {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleReverseGeocoder {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> DispatchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        })
    }
}

fn first_address(response: GeocodeResponse) -> DispatchResult<Option<String>> {
    match response.status.as_str() {
        "OK" => Ok(response
            .results
            .into_iter()
            .next()
            .map(|result| result.formatted_address)),
        "ZERO_RESULTS" => Ok(None),
        "OVER_QUERY_LIMIT" => Err(DispatchError::ProviderRateLimited),
        _ => Err(DispatchError::ProviderRejected(
            response.error_message.unwrap_or(response.status),
        )),
    }
}

#[async_trait]
impl ReverseGeocoder for GoogleReverseGeocoder {
    async fn address_for(&self, location: Coordinate) -> DispatchResult<Option<String>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latlng", format!("{},{}", location.latitude, location.longitude)),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: GeocodeResponse = response.json().await?;
        let address = first_address(body)?;
        tracing::debug!("Reverse geocoded {},{}: {:?}", location.latitude, location.longitude, address);
        Ok(address)
    }
}

/// Used when no maps key is configured.
pub struct NoopGeocoder;

#[async_trait]
impl ReverseGeocoder for NoopGeocoder {
    async fn address_for(&self, _location: Coordinate) -> DispatchResult<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: serde_json::Value) -> GeocodeResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_first_address() {
        let body = response(json!({
            "status": "OK",
            "results": [
                {"formatted_address": "Alaaddin Tepesi, Selçuklu/Konya"},
                {"formatted_address": "Konya"}
            ]
        }));
        assert_eq!(
            first_address(body).unwrap().as_deref(),
            Some("Alaaddin Tepesi, Selçuklu/Konya")
        );
    }

    #[test]
    fn test_no_results_is_not_an_error() {
        let body = response(json!({"status": "ZERO_RESULTS", "results": []}));
        assert_eq!(first_address(body).unwrap(), None);
    }

    #[test]
    fn test_denied_request() {
        let body = response(json!({"status": "REQUEST_DENIED", "error_message": "bad key"}));
        match first_address(body) {
            Err(DispatchError::ProviderRejected(msg)) => assert_eq!(msg, "bad key"),
            other => panic!("Expected ProviderRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_noop_geocoder() {
        assert_eq!(NoopGeocoder.address_for(Coordinate::new(1.0, 1.0)).await.unwrap(), None);
    }
}
