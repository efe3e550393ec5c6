//! API client for communicating with the GMS REST backend.
//!
//! This module provides the `ApiClient` struct for signing in, verifying
//! bearer tokens and fetching pickup locations.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::{header, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::models::{
    LoginRequest, LoginResponse, PickupLocation, PickupLocationResponse, VerifyResponse,
};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the GMS backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    /// Sign in with email and password.
    ///
    /// A rejected sign-in that still carries a JSON body is returned as a
    /// `LoginResponse` with `success == false`, so the caller can show the
    /// backend's message.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse> {
        let url = format!("{}/api/auth/login", self.base_url);
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(ApiError::from_transport)
            .context("Failed to send login request")?;

        let status = response.status();
        let body = read_body_lenient(response).await;

        if status.is_success() {
            return serde_json::from_slice(&body).context("Failed to parse login response");
        }

        match serde_json::from_slice::<LoginResponse>(&body) {
            Ok(rejected) if rejected.message.is_some() => {
                debug!(%status, "Login rejected by backend");
                Ok(LoginResponse {
                    success: false,
                    ..rejected
                })
            }
            _ => Err(ApiError::from_status(status, &String::from_utf8_lossy(&body)).into()),
        }
    }

    /// Ask the backend whether `token` is still accepted.
    pub async fn verify_token(&self, token: &str) -> Result<bool, ApiError> {
        let url = format!("{}/api/auth/verify", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        let body = read_body_lenient(response).await;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(true);
        }
        match serde_json::from_slice::<VerifyResponse>(&body) {
            Ok(verify) => Ok(verify.valid),
            Err(e) => {
                debug!(error = %e, "Unrecognized verify body, treating 2xx as valid");
                Ok(true)
            }
        }
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, retrying rate-limited responses with exponential backoff.
    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build()
                .send()
                .await
                .map_err(ApiError::from_transport)
                .with_context(|| format!("Failed to send request to {}", url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let headers = self.auth_headers()?;
        let response = self
            .send_with_retry(url, || self.client.get(url).headers(headers.clone()))
            .await?;

        let body = read_body_lenient(response).await;
        serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse JSON response from {}", url))
    }

    // ===== Pickup Locations =====

    /// Fetch every pickup location
    pub async fn fetch_pickup_locations(&self) -> Result<Vec<PickupLocation>> {
        let url = format!("{}/api/pickup-locations", self.base_url);
        let response: PickupLocationResponse = self.get(&url).await?;
        if !response.success {
            return Err(ApiError::InvalidResponse(
                response.message.unwrap_or_else(|| "Unknown error".to_string()),
            )
            .into());
        }
        let locations = response.locations.unwrap_or_default();
        debug!(count = locations.len(), "Fetched pickup locations");
        Ok(locations)
    }

    /// Fetch a single pickup location by id
    pub async fn fetch_pickup_location(&self, id: &str) -> Result<PickupLocation> {
        let url = format!("{}/api/pickup-locations/{}", self.base_url, id);
        let response: PickupLocationResponse = self.get(&url).await?;
        if !response.success {
            return Err(ApiError::InvalidResponse(
                response.message.unwrap_or_else(|| "Unknown error".to_string()),
            )
            .into());
        }
        response
            .location
            .ok_or_else(|| ApiError::NotFound(format!("pickup location {}", id)).into())
    }
}

impl TokenVerifier for ApiClient {
    fn verify(&self, token: &str) -> impl Future<Output = Result<bool, ApiError>> + Send {
        self.verify_token(token)
    }
}

/// Read a response body to the end, keeping whatever arrived if the
/// transfer breaks off part way. Some backends close chunked responses
/// without the terminating chunk; the payload is usually complete anyway.
async fn read_body_lenient(response: reqwest::Response) -> Vec<u8> {
    let chunked = response
        .headers()
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => body.extend_from_slice(&bytes),
            Err(e) => {
                warn!(error = %e, received = body.len(), chunked, "Response body ended early, using partial body");
                break;
            }
        }
    }
    body
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP request with a canned raw response.
    async fn serve_once(raw_response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(raw_response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    /// Read headers and a Content-Length body so the socket closes cleanly.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < pos + 4 + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                return;
            }
        }
    }

    fn client(base_url: &str) -> ApiClient {
        ApiClient::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_verify_token_valid() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\nConnection: close\r\n\r\n{\"valid\":true}",
        )
        .await;
        assert!(client(&url).verify_token("a.b.c").await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_token_unauthorized() {
        let url = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let err = client(&url).verify_token("a.b.c").await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(!err.is_connectivity());
    }

    #[tokio::test]
    async fn test_verify_token_connection_refused_is_offline() {
        // Bind then drop to get a port nothing is listening on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = client(&format!("http://{}", addr))
            .verify_token("a.b.c")
            .await
            .unwrap_err();
        assert!(err.is_connectivity(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_truncated_chunked_body_keeps_partial_payload() {
        // Final zero-length chunk is missing
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\n[1,2]\r\n",
        )
        .await;
        let values: Vec<i32> = client(&url).get(&format!("{}/numbers", url)).await.unwrap();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_login_rejection_returns_message() {
        let url = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\nContent-Length: 46\r\nConnection: close\r\n\r\n{\"success\":false,\"message\":\"Invalid password\"}",
        )
        .await;
        let resp = client(&url).login("a@b.c", "nope").await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.into_accepted(None).unwrap_err(), "Invalid password");
    }

    #[tokio::test]
    async fn test_fetch_pickup_locations() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 66\r\nConnection: close\r\n\r\n{\"success\":true,\"locations\":[{\"id\":\"loc-1\",\"siteName\":\"Depot A\"}]}",
        )
        .await;
        let locations = client(&url).fetch_pickup_locations().await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].site_name, "Depot A");
    }
}
