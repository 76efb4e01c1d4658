//! Resilient dispatch to the document-extraction service.
//!
//! Outbound HTTP goes through the [`Transport`] trait so the retry protocol
//! can be tested without a network. The real implementation holds two
//! prebuilt `reqwest` clients: the primary one resolves the service hostname
//! normally, the fallback one pins DNS to a configured address while the
//! request keeps the original hostname, so the service's virtual hosting
//! still routes the call.

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::multipart::UploadedFile;
use async_trait::async_trait;
use serde::Deserialize;

pub const UPLOAD_PATH: &str = "/api/v1/parsing/upload";

/// Which network route an attempt used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    Fallback,
}

/// Response as seen on the wire, before any interpretation.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: String,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request that never produced a response.
#[derive(Debug, Clone)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    /// DNS resolution or TCP/TLS connection failure.
    Connect,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Anything else (request construction, body streaming).
    Other,
}

impl WireError {
    /// Connectivity failures are the only class the fallback route may fix.
    pub fn is_connectivity(&self) -> bool {
        matches!(self.kind, WireErrorKind::Connect | WireErrorKind::Timeout)
    }
}

pub type WireResult = std::result::Result<WireResponse, WireError>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a multipart upload (file + fixed form fields) to `path`.
    async fn upload(
        &self,
        endpoint: Endpoint,
        path: &str,
        file: &UploadedFile,
        fields: &[(&'static str, String)],
    ) -> WireResult;

    /// GET a JSON resource at `path`.
    async fn fetch(&self, endpoint: Endpoint, path: &str) -> WireResult;

    /// Whether a fallback route exists at all.
    fn has_fallback(&self) -> bool;
}

// ============================================================================
// reqwest-backed transport
// ============================================================================

pub struct HttpTransport {
    config: ServiceConfig,
    primary: reqwest::Client,
    fallback: Option<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let primary = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(anyhow::Error::from)?;

        let fallback = match config.fallback_addr {
            Some(addr) => {
                let host = config.host()?;
                // The certificate is issued for the hostname, not the raw
                // address. Verification stays relaxed on this client only;
                // the primary client is untouched.
                let client = reqwest::Client::builder()
                    .timeout(config.timeout)
                    .resolve(&host, addr)
                    .danger_accept_invalid_certs(true)
                    .build()
                    .map_err(anyhow::Error::from)?;
                Some(client)
            }
            None => None,
        };

        Ok(HttpTransport {
            config,
            primary,
            fallback,
        })
    }

    fn client(&self, endpoint: Endpoint) -> std::result::Result<&reqwest::Client, WireError> {
        match endpoint {
            Endpoint::Primary => Ok(&self.primary),
            Endpoint::Fallback => self.fallback.as_ref().ok_or_else(|| WireError {
                kind: WireErrorKind::Other,
                message: "no fallback address configured".to_string(),
            }),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

fn wire_error(err: reqwest::Error) -> WireError {
    let kind = if err.is_connect() {
        WireErrorKind::Connect
    } else if err.is_timeout() {
        WireErrorKind::Timeout
    } else {
        WireErrorKind::Other
    };
    WireError {
        kind,
        message: err.to_string(),
    }
}

async fn read_response(response: reqwest::Response) -> WireResult {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(wire_error)?;
    Ok(WireResponse { status, body })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        endpoint: Endpoint,
        path: &str,
        file: &UploadedFile,
        fields: &[(&'static str, String)],
    ) -> WireResult {
        let part = reqwest::multipart::Part::bytes(file.content.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .map_err(wire_error)?;
        let mut form = reqwest::multipart::Form::new().part("file", part);
        for (name, value) in fields {
            form = form.text(*name, value.clone());
        }

        let response = self
            .client(endpoint)?
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(wire_error)?;
        read_response(response).await
    }

    async fn fetch(&self, endpoint: Endpoint, path: &str) -> WireResult {
        let response = self
            .client(endpoint)?
            .get(self.url(path))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(wire_error)?;
        read_response(response).await
    }

    fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// A parse job accepted by the service. Polling sticks to whichever route
/// accepted the upload.
#[derive(Debug, Clone)]
pub struct ParseJob {
    pub id: String,
    pub endpoint: Endpoint,
}

pub struct Dispatcher<T: Transport> {
    transport: T,
    language: String,
    premium_mode: bool,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, config: &ServiceConfig) -> Self {
        Dispatcher {
            transport,
            language: config.language.clone(),
            premium_mode: config.premium_mode,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn form_fields(&self, ocr: bool) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("result_type", "json".to_string()),
            ("language", self.language.clone()),
            ("premium_mode", self.premium_mode.to_string()),
        ];
        if ocr {
            fields.push(("ocr", "true".to_string()));
        }
        fields
    }

    /// Submit one file for parsing. On a connectivity failure the upload is
    /// retried exactly once against the fallback route; application errors
    /// are surfaced unchanged, never retried.
    pub async fn submit(&self, file: &UploadedFile, ocr: bool) -> Result<ParseJob> {
        let fields = self.form_fields(ocr);

        let (endpoint, response) = match self
            .transport
            .upload(Endpoint::Primary, UPLOAD_PATH, file, &fields)
            .await
        {
            Ok(response) => (Endpoint::Primary, response),
            Err(primary_err) if primary_err.is_connectivity() && self.transport.has_fallback() => {
                tracing::warn!(
                    filename = %file.filename,
                    error = %primary_err.message,
                    "primary endpoint unreachable, retrying via fallback address"
                );
                match self
                    .transport
                    .upload(Endpoint::Fallback, UPLOAD_PATH, file, &fields)
                    .await
                {
                    Ok(response) => (Endpoint::Fallback, response),
                    Err(fallback_err) => {
                        return Err(Error::UpstreamUnavailable {
                            primary: primary_err.message,
                            fallback: fallback_err.message,
                        })
                    }
                }
            }
            Err(primary_err) if primary_err.is_connectivity() => {
                return Err(Error::UpstreamUnavailable {
                    primary: primary_err.message,
                    fallback: "no fallback address configured".to_string(),
                })
            }
            Err(other) => {
                return Err(Error::UpstreamError {
                    status: 0,
                    detail: other.message,
                })
            }
        };

        if !response.is_success() {
            return Err(Error::UpstreamError {
                status: response.status,
                detail: truncate(&response.body, 512),
            });
        }

        #[derive(Deserialize)]
        struct Accepted {
            id: String,
        }
        let accepted: Accepted = serde_json::from_str(&response.body).map_err(|e| {
            Error::UpstreamError {
                status: response.status,
                detail: format!("upload response is not valid JSON: {e}"),
            }
        })?;

        tracing::info!(
            filename = %file.filename,
            job_id = %accepted.id,
            endpoint = ?endpoint,
            "upload accepted"
        );
        Ok(ParseJob {
            id: accepted.id,
            endpoint,
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// ============================================================================
// Scripted transport for tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::mock::{Call, MockTransport};
    use super::*;
    use std::time::Duration;

    fn test_file() -> UploadedFile {
        UploadedFile {
            content: b"%PDF-1.7 test".to_vec(),
            filename: "invoice.pdf".to_string(),
            content_type: "application/pdf".to_string(),
        }
    }

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            base_url: "https://api.cloud.llamaindex.ai".to_string(),
            fallback_addr: None,
            api_key: "llx-test".to_string(),
            timeout: Duration::from_secs(30),
            language: "en".to_string(),
            premium_mode: true,
        }
    }

    #[tokio::test]
    async fn successful_upload_uses_primary_only() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::ok(200, r#"{"id":"job-1","status":"PENDING"}"#));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let job = dispatcher.submit(&test_file(), false).await.unwrap();

        assert_eq!(job.id, "job-1");
        assert_eq!(job.endpoint, Endpoint::Primary);
        assert_eq!(dispatcher.transport().calls().len(), 1);
    }

    #[tokio::test]
    async fn connectivity_failure_triggers_exactly_one_fallback_attempt() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::connect_error("dns error: no such host"));
        transport.push_upload(MockTransport::ok(200, r#"{"id":"job-2"}"#));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let job = dispatcher.submit(&test_file(), false).await.unwrap();

        assert_eq!(job.endpoint, Endpoint::Fallback);
        let calls = dispatcher.transport().calls();
        assert_eq!(
            calls,
            vec![
                Call::Upload {
                    endpoint: Endpoint::Primary,
                    filename: "invoice.pdf".to_string()
                },
                Call::Upload {
                    endpoint: Endpoint::Fallback,
                    filename: "invoice.pdf".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn application_error_is_not_retried() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::ok(422, r#"{"detail":"unsupported file"}"#));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let err = dispatcher.submit(&test_file(), false).await.unwrap_err();

        assert!(matches!(err, Error::UpstreamError { status: 422, .. }));
        // No second attempt of any kind.
        assert_eq!(dispatcher.transport().calls().len(), 1);
    }

    #[tokio::test]
    async fn both_routes_failing_aggregates_both_reasons() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::connect_error("primary refused"));
        transport.push_upload(MockTransport::connect_error("fallback refused"));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let err = dispatcher.submit(&test_file(), false).await.unwrap_err();

        match err {
            Error::UpstreamUnavailable { primary, fallback } => {
                assert!(primary.contains("primary refused"));
                assert!(fallback.contains("fallback refused"));
            }
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_fallback_configured_fails_after_single_attempt() {
        let transport = MockTransport::new().without_fallback();
        transport.push_upload(MockTransport::connect_error("dns error"));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let err = dispatcher.submit(&test_file(), false).await.unwrap_err();

        assert!(matches!(err, Error::UpstreamUnavailable { .. }));
        assert_eq!(dispatcher.transport().calls().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_accept_body_is_an_upstream_error() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::ok(200, "<html>gateway</html>"));

        let dispatcher = Dispatcher::new(transport, &test_config());
        let err = dispatcher.submit(&test_file(), false).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamError { .. }));
    }

    #[test]
    fn ocr_flag_adds_form_field() {
        let dispatcher = Dispatcher::new(MockTransport::new(), &test_config());
        let plain = dispatcher.form_fields(false);
        let ocr = dispatcher.form_fields(true);
        assert!(!plain.iter().any(|(n, _)| *n == "ocr"));
        assert!(ocr.iter().any(|(n, v)| *n == "ocr" && v == "true"));
    }
}
