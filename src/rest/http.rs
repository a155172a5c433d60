//! reqwest-backed transport.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};

use super::{Method, RestError, RestRequest, RestResponse, Transport};
use crate::config::Config;
use crate::config::secrets::{AUTH_HEADER, ExposeSecret};
use crate::error::{Error, Result};

/// Talks to the platform over HTTPS.
///
/// With an API token, one client carrying the auth header is reused for
/// every request. Without one, requests rely on the ambient session of the
/// host (e.g. a local proxy that injects credentials).
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let mut value = HeaderValue::from_str(token.expose_secret())
                .map_err(|_| Error::Config("API token is not a valid header value".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTH_HEADER, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_tls);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: RestRequest) -> std::result::Result<RestResponse, RestError> {
        let builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        let builder = match request.body {
            Some(body) => builder.json(&body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RestError::Transport(e.to_string()))?;

        Ok(RestResponse { status, body })
    }
}
