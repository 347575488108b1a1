// API client module: a small blocking HTTP client for puush-compatible
// hosts, plus the retrying `Uploader` the pipeline talks to.
//
// The wire format is the classic puush one: multipart upload to `/api/up`
// with the API key in the `k` field, answered by a comma separated line
// `status,url,id,usage`.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::blocking::{multipart, Client};
use reqwest::StatusCode;

use crate::capture::Artifact;
use crate::error::UploadError;
use crate::retry::{CancelToken, RetryPolicy};

/// Opaque API key. Construction validates the shape only; whether the
/// server accepts it is decided by the upload.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(token: impl Into<String>) -> Result<Self, UploadError> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(UploadError::Auth("no API key configured".into()));
        }
        if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(UploadError::Auth("API key contains invalid characters".into()));
        }
        Ok(Credentials(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Keep keys out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// A successful upload. The URL is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    url: String,
    retries: u32,
}

impl UploadResult {
    /// `None` when `url` is blank.
    pub fn new(url: impl Into<String>, retries: u32) -> Option<Self> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            None
        } else {
            Some(Self { url, retries })
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// How many times the upload had to be retried before it went through.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Account details returned by the login endpoint.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub api_key: String,
    pub premium: bool,
    pub expiry: Option<String>,
    pub usage_bytes: Option<u64>,
}

/// Interpret the body of an `/api/up` response.
///
/// Returns the uploaded URL on success.
pub fn parse_upload_response(status: StatusCode, body: &str) -> Result<String, UploadError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(UploadError::Auth(format!("server returned {status}")));
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(UploadError::network(format!("server returned {status}")));
    }
    if !status.is_success() {
        return Err(UploadError::Protocol(format!("server returned {status}: {}", body.trim())));
    }

    let line = body.trim();
    let mut fields = line.split(',');
    let code = fields.next().unwrap_or_default().trim();
    match code.parse::<i32>() {
        Ok(0) => {
            let url = fields.next().unwrap_or_default().trim();
            if url.is_empty() {
                Err(UploadError::Protocol("response carried no URL".into()))
            } else if !(url.starts_with("http://") || url.starts_with("https://")) {
                Err(UploadError::Protocol(format!("response URL `{url}` is not http(s)")))
            } else {
                Ok(url.to_string())
            }
        }
        Ok(-1) => Err(UploadError::Auth("API key rejected".into())),
        Ok(other) => Err(UploadError::Protocol(format!("server reported error code {other}"))),
        Err(_) => Err(UploadError::Protocol(format!("malformed response `{line}`"))),
    }
}

/// Interpret the body of an `/api/auth` response.
pub fn parse_auth_response(body: &str) -> Result<AuthResponse, UploadError> {
    let line = body.trim();
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let status = fields
        .first()
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(|| UploadError::Protocol(format!("malformed response `{line}`")))?;
    if status < 0 {
        return Err(UploadError::Auth("e-mail or password rejected".into()));
    }
    let api_key = fields.get(1).copied().unwrap_or_default();
    if api_key.is_empty() {
        return Err(UploadError::Protocol("response carried no API key".into()));
    }
    Ok(AuthResponse {
        api_key: api_key.to_string(),
        premium: status > 0,
        expiry: fields.get(2).filter(|s| !s.is_empty()).map(|s| s.to_string()),
        usage_bytes: fields.get(3).and_then(|s| s.parse().ok()),
    })
}

/// A single upload attempt. Implementations perform exactly one request.
pub trait Transport {
    fn send(&self, artifact: &Artifact, credentials: &Credentials) -> Result<String, UploadError>;
}

/// Blocking reqwest client bound to one host.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client for `base_url` (e.g. `https://puush.me`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("puush-linux/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ApiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange e-mail and password for an API key.
    pub fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let url = format!("{}/api/auth", &self.base_url);
        let res = self
            .client
            .post(&url)
            .form(&[("e", email), ("p", password)])
            .send()
            .context("Failed to send auth request")?;
        if !res.status().is_success() {
            let status = res.status();
            let txt = res.text().unwrap_or_default();
            anyhow::bail!("Login failed: {} - {}", status, txt);
        }
        let body = res.text().context("Reading auth response")?;
        let resp = parse_auth_response(&body)?;
        info!("logged in (premium: {})", resp.premium);
        Ok(resp)
    }
}

impl Transport for ApiClient {
    fn send(&self, artifact: &Artifact, credentials: &Credentials) -> Result<String, UploadError> {
        let url = format!("{}/api/up", &self.base_url);

        let part = multipart::Part::bytes(artifact.data().to_vec())
            .file_name(artifact.file_name())
            .mime_str(artifact.format().mime_type())
            .map_err(|e| UploadError::Protocol(format!("invalid mime type: {e}")))?;
        let form = multipart::Form::new()
            .text("k", credentials.as_str().to_string())
            .text("z", "poop")
            .part("f", part);

        let res = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(classify_request_error)?;
        let status = res.status();
        let body = res.text().map_err(classify_request_error)?;
        debug!("upload response {}: {}", status, body.trim());
        parse_upload_response(status, &body)
    }
}

fn classify_request_error(e: reqwest::Error) -> UploadError {
    if e.is_builder() {
        UploadError::Protocol(e.to_string())
    } else {
        // Connects, resets, timeouts and truncated bodies are all worth
        // another attempt.
        UploadError::network(e.to_string())
    }
}

/// What the pipeline needs from an uploader.
pub trait Uploader {
    fn upload(
        &self,
        artifact: &Artifact,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<UploadResult, UploadError>;
}

impl<U: Uploader + ?Sized> Uploader for &U {
    fn upload(
        &self,
        artifact: &Artifact,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<UploadResult, UploadError> {
        (**self).upload(artifact, credentials, cancel)
    }
}

/// Wraps a `Transport` with bounded exponential backoff for transient
/// failures. Auth and protocol errors fail immediately.
pub struct RetryingUploader<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingUploader<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Uploader for RetryingUploader<T> {
    fn upload(
        &self,
        artifact: &Artifact,
        credentials: &Credentials,
        cancel: &CancelToken,
    ) -> Result<UploadResult, UploadError> {
        if artifact.data().is_empty() {
            return Err(UploadError::InvalidArtifact);
        }

        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            match self.transport.send(artifact, credentials) {
                Ok(url) => {
                    return UploadResult::new(url, retries)
                        .ok_or_else(|| UploadError::Protocol("response carried no URL".into()));
                }
                Err(UploadError::Network { reason, .. }) if retries < self.policy.max_retries => {
                    retries += 1;
                    let delay = self.policy.delay_for(retries);
                    warn!(
                        "upload attempt {} failed ({}), retrying in {:?}",
                        retries, reason, delay
                    );
                    if cancel.wait_timeout(delay) {
                        return Err(UploadError::Cancelled);
                    }
                }
                Err(UploadError::Network { reason, .. }) => {
                    return Err(UploadError::Network {
                        reason,
                        attempts: retries + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
