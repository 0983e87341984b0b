use crate::auth::TokenProvider;
use crate::errors::{Error, Result};
use crate::model::MowerSnapshot;
use serde_json::Value;
use tracing::{info, warn};

/// Client for the fleet REST API, used to seed state at startup.
#[derive(Debug, Clone)]
pub struct FleetClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FleetClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Lists the fleet, refreshing the token and retrying once if the first
    /// request is rejected.
    pub async fn fetch_snapshot(&self, tokens: &dyn TokenProvider) -> Result<Vec<MowerSnapshot>> {
        let token = tokens.current_token().await?;
        let snapshot = match self.get_mowers(&token).await {
            Err(Error::Unauthorized(status)) => {
                warn!("Fleet API rejected token ({}), refreshing", status);
                let token = tokens.force_refresh().await?;
                self.get_mowers(&token).await?
            }
            other => other?,
        };

        info!("Loaded snapshot of {} mowers", snapshot.len());
        Ok(snapshot)
    }

    async fn get_mowers(&self, token: &str) -> Result<Vec<MowerSnapshot>> {
        let response = self
            .client
            .get(format!("{}/mowers", self.base_url))
            .header("Authorization-Provider", "husqvarna")
            .header("X-Api-Key", &self.api_key)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status().as_u16();
        if matches!(status, 401 | 403) {
            return Err(Error::Unauthorized(status));
        }

        let body: Value = response.error_for_status()?.json().await?;
        Ok(parse_snapshot(&body))
    }
}

/// Reads `data[]` of a fleet listing. Entries without an id are skipped.
pub fn parse_snapshot(body: &Value) -> Vec<MowerSnapshot> {
    let Some(entries) = body.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let mower_id = entry.get("id").and_then(Value::as_str)?;
            let attributes = entry.get("attributes");
            let text = |pointer: &str| {
                attributes
                    .and_then(|a| a.pointer(pointer))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };

            Some(MowerSnapshot {
                mower_id: mower_id.to_string(),
                name: text("/system/name"),
                activity: text("/mower/activity"),
                battery_percent: attributes
                    .and_then(|a| a.pointer("/battery/batteryPercent"))
                    .and_then(Value::as_f64),
            })
        })
        .collect()
}
