use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PromotionError;
use crate::types::ReloadStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    pub timeout_secs: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self { timeout_secs: 5 }
    }
}

impl ReloadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        if self.timeout_secs == 0 {
            vec!["reload.timeout_secs must be greater than zero".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Tells a live service to re-read its model from disk.
///
/// Best effort: a failed notification is reported in the returned
/// [`ReloadStatus`] and never undoes a promotion.
#[derive(Debug, Clone)]
pub struct ReloadNotifier {
    client: Client,
}

impl ReloadNotifier {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self { client }
    }

    pub fn from_settings(settings: &ReloadSettings) -> Self {
        Self::new(settings.timeout())
    }

    /// POST an empty body to `url`. A missing or blank URL skips the call.
    pub async fn notify(&self, url: Option<&str>) -> ReloadStatus {
        let url = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => {
                debug!("No reload endpoint configured");
                return ReloadStatus::Skipped;
            }
        };

        match self.post(url).await {
            Ok(code) => {
                info!("Reload accepted by {} ({})", url, code);
                ReloadStatus::Ok(code)
            }
            Err(e) => {
                warn!("{} ({})", e, url);
                match e {
                    PromotionError::ReloadFailed(cause) => ReloadStatus::Failed(cause),
                    other => ReloadStatus::Failed(other.to_string()),
                }
            }
        }
    }

    async fn post(&self, url: &str) -> Result<u16, PromotionError> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| PromotionError::ReloadFailed(transport_cause(&e)))?;

        let status = resp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(PromotionError::ReloadFailed(format!("status={}", status.as_u16())))
        }
    }
}

fn transport_cause(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timeout".to_string()
    } else if e.is_connect() {
        "connect_error".to_string()
    } else if e.is_builder() {
        "invalid_url".to_string()
    } else {
        e.to_string()
    }
}
