use crate::config::InfluxConfig;
use crate::telemetry::{render_batch, Measurement};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store unavailable (HTTP {status}): {body}")]
    Unavailable { status: u16, body: String },
    #[error("store rejected write (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

impl StoreError {
    /// Transient failures are worth retrying; a rejected write fails the same way again.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected { .. })
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            StoreError::Unavailable {
                status: status.as_u16(),
                body,
            }
        } else {
            StoreError::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Batch-write contract of the time-series store.
#[async_trait]
pub trait PointStore: Send + Sync {
    async fn write_batch(&self, batch: &[Measurement]) -> Result<(), StoreError>;

    /// Releases the connection. Called once, after the final flush.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Writes points to the InfluxDB v2 HTTP API in line protocol.
pub struct InfluxStore {
    client: Client,
    write_url: String,
    token: String,
    measurement: String,
}

impl InfluxStore {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(5)))
            .build()
            .context("failed to build InfluxDB HTTP client")?;
        let write_url = reqwest::Url::parse_with_params(
            &format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .with_context(|| format!("invalid InfluxDB URL {}", config.url))?;

        Ok(Self {
            client,
            write_url: write_url.to_string(),
            token: config.token.clone(),
            measurement: config.measurement.clone(),
        })
    }
}

#[async_trait]
impl PointStore for InfluxStore {
    async fn write_batch(&self, batch: &[Measurement]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = render_batch(&self.measurement, batch);
        let response = self
            .client
            .post(&self.write_url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::from_status(status, body))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InfluxConfig {
        InfluxConfig {
            url: "http://localhost:8086/".to_string(),
            token: "secret".to_string(),
            org: "Smart Fenix".to_string(),
            bucket: "smartfenix".to_string(),
            measurement: "sensor_measurement".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn write_url_carries_org_bucket_and_precision() {
        let store = InfluxStore::new(&config()).expect("store");
        assert_eq!(
            store.write_url,
            "http://localhost:8086/api/v2/write?org=Smart+Fenix&bucket=smartfenix&precision=ns"
        );
    }

    #[test]
    fn status_classification() {
        assert!(StoreError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(StoreError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!StoreError::from_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
        assert!(!StoreError::from_status(StatusCode::UNAUTHORIZED, String::new()).is_transient());
    }
}
