//! reqwest client for the host daemon's HTTP surface

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::transport::{Announcement, FetchResponse, QuoteResponse, ShardTransport, StoreRequest};
use super::TransferError;
use crate::identity::PublicKeys;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 2;

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransferError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransferError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}/{}", endpoint.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransferError> {
        let response = self
            .client
            .get(Self::url(endpoint, path))
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| TransferError::InvalidResponse(e.to_string()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout(e.to_string())
    } else {
        TransferError::Network(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return Err(TransferError::Busy { retry_after_secs });
    }
    let message = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(TransferError::NotFound(message));
    }
    Err(TransferError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ShardTransport for HttpTransport {
    async fn public_keys(&self, endpoint: &str) -> Result<PublicKeys, TransferError> {
        self.get_json(endpoint, "pubkeys", &[]).await
    }

    async fn store(&self, endpoint: &str, request: &StoreRequest) -> Result<(), TransferError> {
        let response = self
            .client
            .post(Self::url(endpoint, "store"))
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn fetch(&self, endpoint: &str, asset_id: &str, index: usize) -> Result<String, TransferError> {
        let response: FetchResponse = self
            .get_json(
                endpoint,
                "fetch",
                &[("asset_id", asset_id.to_string()), ("index", index.to_string())],
            )
            .await?;
        Ok(response.data_b64)
    }

    async fn announce(&self, endpoint: &str) -> Result<Announcement, TransferError> {
        self.get_json(endpoint, "announce", &[]).await
    }

    async fn quote(&self, endpoint: &str, resource_type: &str, size: f64) -> Result<f64, TransferError> {
        let response: QuoteResponse = self
            .get_json(
                endpoint,
                "quote",
                &[("type", resource_type.to_string()), ("size", size.to_string())],
            )
            .await?;
        Ok(response.quote)
    }
}
