use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MatrixError;
use crate::config::Config;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_result(self) -> Result<Value, MatrixError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(MatrixError::from_response(self.status, &self.body))
        }
    }
}

/// One REST call against the client-server API.
///
/// `access_token == None` authenticates as the application service itself.
/// Any HTTP status is returned to the caller as-is; only failures where no
/// response arrived are handled by the implementation.
#[async_trait]
pub trait HomeserverTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, MatrixError>;
}

pub struct ReqwestTransport {
    http: reqwest::Client,
    homeserver_url: String,
    appservice_token: SecretString,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl ReqwestTransport {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Result<Self, MatrixError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.limits.request_timeout_secs))
            .build()
            .map_err(|e| MatrixError::Malformed(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            homeserver_url: config.bridge.homeserver_url.trim_end_matches('/').to_string(),
            appservice_token: SecretString::from(config.registration.appservice_token.clone()),
            retry_delay: Duration::from_millis(config.limits.request_retry_delay_ms),
            shutdown,
        })
    }
}

#[async_trait]
impl HomeserverTransport for ReqwestTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, MatrixError> {
        let url = format!("{}{}", self.homeserver_url, path);
        let token = access_token.unwrap_or_else(|| self.appservice_token.expose_secret());

        loop {
            let mut request = self.http.request(method.clone(), &url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        method = %method,
                        path = %path,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "homeserver unreachable, retrying: {}",
                        e
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(MatrixError::Shutdown),
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
            };

            let status = response.status().as_u16();
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(method = %method, path = %path, "failed to read response body: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(MatrixError::Shutdown),
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
            };

            let body = if text.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => value,
                    Err(_) if !(200..300).contains(&status) => json!({ "error": text }),
                    Err(e) => {
                        return Err(MatrixError::Malformed(format!(
                            "{method} {path} returned non-json body: {e}"
                        )));
                    }
                }
            };

            debug!(method = %method, path = %path, status, "homeserver request completed");
            return Ok(ApiResponse { status, body });
        }
    }
}
