//! Invoice processing workflow: dispatch, poll, parse, validate.
//!
//! Batches run files concurrently with a bounded fan-out; each file succeeds
//! or fails on its own, and one bad file never sinks its siblings.

use crate::dispatch::{Dispatcher, Transport};
use crate::error::{Error, Result};
use crate::invoice::InvoiceData;
use crate::job::{await_result, PollConfig};
use crate::multipart::UploadedFile;
use axum::http::StatusCode;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;

/// Per-file result of a batch run.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FileOutcome {
    Success { filename: String, data: InvoiceData },
    Error { filename: String, message: String },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Success { .. })
    }

    pub fn filename(&self) -> &str {
        match self {
            FileOutcome::Success { filename, .. } => filename,
            FileOutcome::Error { filename, .. } => filename,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub results: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Overall status reflects whether *any* file succeeded: full success
    /// 200, partial 207, total failure 500.
    pub fn status_code(&self) -> StatusCode {
        let ok = self.succeeded();
        if ok == self.results.len() {
            StatusCode::OK
        } else if ok > 0 {
            StatusCode::MULTI_STATUS
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub struct Workflow<T: Transport> {
    dispatcher: Dispatcher<T>,
    poll: PollConfig,
    max_concurrency: usize,
}

impl<T: Transport> Workflow<T> {
    pub fn new(dispatcher: Dispatcher<T>, poll: PollConfig, max_concurrency: usize) -> Self {
        Workflow {
            dispatcher,
            poll,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run one file through the full pipeline. An empty parse result gets a
    /// single OCR-mode re-parse (image-only PDFs often need it) before the
    /// request is declared failed.
    pub async fn process(&self, file: &UploadedFile) -> Result<InvoiceData> {
        tracing::info!(filename = %file.filename, "processing invoice");

        let document = self.parse_once(file, false).await?;
        let payload = match payload_text(&document) {
            Some(text) => text,
            None => {
                tracing::info!(
                    filename = %file.filename,
                    "parse returned no text, retrying with OCR"
                );
                let document = self.parse_once(file, true).await?;
                payload_text(&document).ok_or_else(|| Error::UpstreamError {
                    status: 200,
                    detail: "parse returned no data even after OCR retry".to_string(),
                })?
            }
        };

        let invoice = InvoiceData::from_json_text(&payload).map_err(|e| Error::UpstreamError {
            status: 200,
            detail: format!("failed to decode structured JSON from parse result: {e}"),
        })?;
        invoice.validate().map_err(|feedback| Error::UpstreamError {
            status: 200,
            detail: format!("extracted data failed validation: {feedback}"),
        })?;

        tracing::info!(filename = %file.filename, "invoice processed");
        Ok(invoice)
    }

    async fn parse_once(&self, file: &UploadedFile, ocr: bool) -> Result<Value> {
        let job = self.dispatcher.submit(file, ocr).await?;
        await_result(self.dispatcher.transport(), &job, &self.poll).await
    }

    /// Process a batch with bounded concurrency, preserving input order in
    /// the report.
    pub async fn process_batch(&self, files: Vec<UploadedFile>) -> BatchReport {
        let mut outcomes = stream::iter(files.into_iter().enumerate())
            .map(|(index, file)| async move {
                let outcome = match self.process(&file).await {
                    Ok(data) => FileOutcome::Success {
                        filename: file.filename.clone(),
                        data,
                    },
                    Err(err) => {
                        tracing::error!(
                            filename = %file.filename,
                            error = %err.detailed_message(),
                            "file failed"
                        );
                        FileOutcome::Error {
                            filename: file.filename.clone(),
                            message: err.user_message(),
                        }
                    }
                };
                (index, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        BatchReport {
            results: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        }
    }
}

/// The structured payload inside a parse result document. The service
/// normally wraps it as `pages[0].text`; a bare object is accepted too.
fn payload_text(document: &Value) -> Option<String> {
    if let Some(text) = document.pointer("/pages/0/text").and_then(Value::as_str) {
        if text.trim().is_empty() {
            return None;
        }
        return Some(text.to_string());
    }
    if document.is_object() && document.get("pages").is_none() {
        return Some(document.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::dispatch::mock::MockTransport;
    use crate::invoice::LineItem;
    use std::time::Duration;

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            base_url: "https://api.cloud.llamaindex.ai".to_string(),
            fallback_addr: None,
            api_key: "llx-test".to_string(),
            timeout: Duration::from_secs(30),
            language: "en".to_string(),
            premium_mode: true,
        }
    }

    fn workflow(transport: MockTransport) -> Workflow<MockTransport> {
        let dispatcher = Dispatcher::new(transport, &service_config());
        let poll = PollConfig {
            interval: Duration::from_millis(1),
            max_attempts: 10,
        };
        // Serial execution keeps the scripted mock queues deterministic.
        Workflow::new(dispatcher, poll, 1)
    }

    fn invoice() -> InvoiceData {
        InvoiceData {
            invoice_number: Some("INV-9".to_string()),
            date: Some("2025-06-01".to_string()),
            vendor_name: Some("Vendor Ab".to_string()),
            total_amount: Some(100.0),
            line_items: Some(vec![LineItem {
                description: Some("thing".to_string()),
                quantity: Some(4.0),
                unit_price: Some(25.0),
                total_price: Some(100.0),
            }]),
        }
    }

    fn file(name: &str) -> UploadedFile {
        UploadedFile {
            content: b"%PDF".to_vec(),
            filename: name.to_string(),
            content_type: "application/pdf".to_string(),
        }
    }

    fn result_doc(data: &InvoiceData) -> String {
        serde_json::json!({
            "pages": [{ "page": 1, "text": serde_json::to_string(data).unwrap() }]
        })
        .to_string()
    }

    fn script_success(transport: &MockTransport, data: &InvoiceData) {
        transport.push_upload(MockTransport::ok(200, r#"{"id":"job-ok"}"#));
        transport.push_fetch(MockTransport::ok(200, r#"{"status":"SUCCESS"}"#));
        transport.push_fetch(MockTransport::ok(200, &result_doc(data)));
    }

    #[tokio::test]
    async fn single_file_end_to_end() {
        let transport = MockTransport::new();
        script_success(&transport, &invoice());

        let wf = workflow(transport);
        let data = wf.process(&file("invoice.pdf")).await.unwrap();
        assert_eq!(data, invoice());
    }

    #[tokio::test]
    async fn empty_parse_result_triggers_one_ocr_retry() {
        let transport = MockTransport::new();
        // First pass: job completes but the text payload is blank.
        transport.push_upload(MockTransport::ok(200, r#"{"id":"job-1"}"#));
        transport.push_fetch(MockTransport::ok(200, r#"{"status":"SUCCESS"}"#));
        transport.push_fetch(MockTransport::ok(200, r#"{"pages":[{"text":"  "}]}"#));
        // OCR pass succeeds.
        script_success(&transport, &invoice());

        let wf = workflow(transport);
        let data = wf.process(&file("scan.pdf")).await.unwrap();
        assert_eq!(data.invoice_number.as_deref(), Some("INV-9"));

        let uploads = wf
            .dispatcher
            .transport()
            .calls()
            .iter()
            .filter(|c| matches!(c, crate::dispatch::mock::Call::Upload { .. }))
            .count();
        assert_eq!(uploads, 2);
    }

    #[tokio::test]
    async fn invalid_extraction_is_an_upstream_error() {
        let mut bad = invoice();
        bad.total_amount = None;
        let transport = MockTransport::new();
        script_success(&transport, &bad);

        let wf = workflow(transport);
        let err = wf.process(&file("invoice.pdf")).await.unwrap_err();
        match err {
            Error::UpstreamError { detail, .. } => {
                assert!(detail.contains("failed validation"))
            }
            other => panic!("expected UpstreamError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_reports_partial_success_per_file() {
        let transport = MockTransport::new();
        script_success(&transport, &invoice()); // file 1
        transport.push_upload(MockTransport::ok(
            422,
            r#"{"detail":"unsupported file type"}"#,
        )); // file 2
        script_success(&transport, &invoice()); // file 3

        let wf = workflow(transport);
        let report = wf
            .process_batch(vec![file("a.pdf"), file("b.tiff"), file("c.pdf")])
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.status_code(), StatusCode::MULTI_STATUS);
        assert_eq!(report.results.len(), 3);
        assert!(report.results[0].is_success());
        assert!(!report.results[1].is_success());
        assert_eq!(report.results[1].filename(), "b.tiff");
        assert!(report.results[2].is_success());
    }

    #[tokio::test]
    async fn batch_with_no_survivors_is_a_server_error() {
        let transport = MockTransport::new();
        transport.push_upload(MockTransport::connect_error("primary down"));
        transport.push_upload(MockTransport::connect_error("fallback down"));

        let wf = workflow(transport);
        let report = wf.process_batch(vec![file("only.pdf")]).await;
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn fully_successful_batch_is_plain_ok() {
        let transport = MockTransport::new();
        script_success(&transport, &invoice());
        script_success(&transport, &invoice());

        let wf = workflow(transport);
        let report = wf.process_batch(vec![file("a.pdf"), file("b.pdf")]).await;
        assert_eq!(report.status_code(), StatusCode::OK);
    }
}
