//! Authenticated HTTP client for the Carbon Black REST API.
//!
//! `CbClient` wraps a `reqwest::Client` configured from [`Credentials`] and
//! provides JSON request helpers (`get`, `post`, `put`, `delete`), a raw byte
//! download (`get_bytes`) and a multipart upload (`post_multipart`).
//!
//! Every request carries the API token in the `X-Auth-Token` header. The
//! token is static, so a `401` is reported as `CbError::Unauthorized` rather
//! than triggering a refresh. Error responses are read as text before the
//! status is classified so the server's diagnostic body survives into the
//! error value.

use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

use crate::error::{CbError, Result};

/// Header used by every Carbon Black product line for API token auth.
const AUTH_HEADER: &str = "X-Auth-Token";

/// Covers TCP + TLS handshake only.
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Full round-trip limit. Generous because `get_bytes` may pull multi-MB
/// files and memory dumps off a sensor.
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection parameters for one Carbon Black server.
///
/// `org_key` is only meaningful for the Platform (PSC) product line. Where
/// these values come from is up to the caller.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Server base URL, e.g. `https://cbresponse.example.com`.
    pub url: String,
    /// API token. For the Platform API this is `secret/id`.
    pub token: String,
    /// Organization key for Platform routes.
    pub org_key: Option<String>,
    /// Verify the server's TLS certificate.
    pub ssl_verify: bool,
}

impl Credentials {
    /// Credentials with TLS verification enabled and no org key.
    pub fn new(url: &str, token: &str) -> Self {
        Credentials {
            url: url.to_string(),
            token: token.to_string(),
            org_key: None,
            ssl_verify: true,
        }
    }
}

fn build_api_client(ssl_verify: bool) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(API_CONNECT_TIMEOUT)
        .timeout(API_REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(!ssl_verify)
        .build()?)
}

/// Authenticated HTTP client for the Carbon Black REST API.
///
/// `base_url` always ends with `/`; request paths are relative and carry no
/// leading slash.
#[derive(Debug, Clone)]
pub struct CbClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CbClient {
    /// Builds a client for the server described by `credentials`.
    pub fn new(credentials: &Credentials) -> Result<Self> {
        let mut base_url = credentials.url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(CbClient {
            client: build_api_client(credentials.ssl_verify)?,
            base_url,
            token: credentials.token.clone(),
        })
    }

    /// Absolute URL for a relative API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTH_HEADER, &self.token)
    }

    /// Maps a non-success response into the matching `CbError` variant.
    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let uri = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(%status, uri = %uri, "request failed");
        Err(match status {
            StatusCode::NOT_FOUND => CbError::ObjectNotFound { uri, body },
            StatusCode::UNAUTHORIZED => CbError::Unauthorized { uri, body },
            _ => CbError::Server { status, uri, body },
        })
    }

    /// Sends a request with an optional JSON body and deserializes the JSON
    /// response. An empty success body deserializes as JSON `null`, so
    /// callers that don't care about the body can ask for
    /// `serde_json::Value`.
    async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let url = self.url(path);
        let mut req = self.request(method, &url);
        if let Some(payload) = body {
            req = req.json(payload);
        }
        let resp = Self::check(req.send().await?).await?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Sends a GET request and deserializes the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json::<T, ()>(Method::GET, path, None).await
    }

    /// Sends a POST request with a JSON body.
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(Method::POST, path, Some(body)).await
    }

    /// Sends a PUT request with a JSON body.
    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(Method::PUT, path, Some(body)).await
    }

    /// Sends a DELETE request, discarding any response body.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        Self::check(self.request(Method::DELETE, &url).send().await?).await?;
        Ok(())
    }

    /// Downloads raw bytes from an API path.
    pub async fn get_bytes(&self, path: &str) -> Result<Bytes> {
        let url = self.url(path);
        let resp = Self::check(self.request(Method::GET, &url).send().await?).await?;
        Ok(resp.bytes().await?)
    }

    /// Uploads `content` as the `file` part of a multipart form and
    /// deserializes the JSON response.
    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        file_name: &str,
        content: Bytes,
    ) -> Result<T> {
        let url = self.url(path);
        let part = reqwest::multipart::Part::stream(content).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = Self::check(
            self.request(Method::POST, &url)
                .multipart(form)
                .send()
                .await?,
        )
        .await?;
        Ok(resp.json::<T>().await?)
    }
}
