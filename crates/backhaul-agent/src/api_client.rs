//! Client for the exposure server's control API

use thiserror::Error;
use tracing::debug;

/// Control API client errors
#[derive(Debug, Error)]
pub enum ApiClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0:?}")]
    Malformed(String),
}

/// Prefix `http://` when the address has no scheme
pub fn normalize_api_url(api: &str) -> String {
    let api = api.trim().trim_end_matches('/');
    if api.contains("://") {
        api.to_string()
    } else {
        format!("http://{}", api)
    }
}

/// Control API client
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api: &str) -> Self {
        Self {
            base_url: normalize_api_url(api),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn text(response: reqwest::Response) -> Result<(u16, String), ApiClientError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Expose `port` as `service`; returns the service token
    pub async fn listen(&self, port: u16, service: &str) -> Result<String, ApiClientError> {
        debug!(port, %service, "Requesting listen");
        let port = port.to_string();
        let response = self
            .http
            .post(self.url("/expose/listen"))
            .form(&[("service", service), ("port", port.as_str())])
            .send()
            .await?;

        match Self::text(response).await? {
            (200, body) => Ok(body.trim().to_string()),
            (status, body) => Err(ApiClientError::Status {
                status,
                body: body.trim().to_string(),
            }),
        }
    }

    /// Revoke a service token
    pub async fn revoke(&self, token: &str) -> Result<(), ApiClientError> {
        debug!(%token, "Requesting revoke");
        let response = self
            .http
            .post(self.url("/expose/revoke"))
            .form(&[("token", token)])
            .send()
            .await?;

        match Self::text(response).await? {
            (200, _) => Ok(()),
            (status, body) => Err(ApiClientError::Status {
                status,
                body: body.trim().to_string(),
            }),
        }
    }

    /// Token and service name exposed on `port`, if any
    pub async fn port(&self, port: u16) -> Result<Option<(String, String)>, ApiClientError> {
        let response = self
            .http
            .get(self.url("/expose/port"))
            .query(&[("port", port)])
            .send()
            .await?;

        match Self::text(response).await? {
            (204, _) => Ok(None),
            (200, body) => parse_port_reply(&body).map(Some),
            (status, body) => Err(ApiClientError::Status {
                status,
                body: body.trim().to_string(),
            }),
        }
    }
}

fn parse_port_reply(body: &str) -> Result<(String, String), ApiClientError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(token), Some(name)) => Ok((token.to_string(), name.to_string())),
        _ => Err(ApiClientError::Malformed(body.to_string())),
    }
}
