//! Hand-rolled multipart/form-data extractor.
//!
//! Serverless gateways hand us the raw request body (sometimes base64-encoded)
//! rather than a parsed stream, so the boundary handling lives here. All
//! scanning is byte-oriented: file payloads are binary (PDF/JPEG) and must
//! never pass through a UTF-8 decode.

use crate::error::{Error, Result};
use base64::prelude::*;
use serde::Deserialize;
use uuid::Uuid;

/// A file recovered from a request body.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub content: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One inbound invocation: decoded body plus the Content-Type header.
/// Constructed once from the gateway event, consumed once.
#[derive(Debug)]
pub struct RequestContext {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl RequestContext {
    pub fn new(raw: Vec<u8>, is_base64: bool, content_type: Option<&str>) -> Result<Self> {
        let body = if is_base64 {
            BASE64_STANDARD
                .decode(&raw)
                .map_err(|e| Error::malformed(format!("body is not valid base64: {e}")))?
        } else {
            raw
        };
        Ok(RequestContext {
            body,
            content_type: content_type.map(str::to_string),
        })
    }
}

/// Pull the boundary token out of a Content-Type header value.
///
/// The parameter name is matched case-insensitively; the value terminates at
/// `;` or whitespace and may be quoted.
pub fn extract_boundary(content_type: &str) -> Result<String> {
    let lower = content_type.to_ascii_lowercase();
    let start = lower
        .find("boundary=")
        .ok_or_else(|| Error::malformed("no boundary in Content-Type header"))?
        + "boundary=".len();
    let rest = &content_type[start..];
    let boundary = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next().unwrap_or("")
    } else {
        rest.split(|c: char| c == ';' || c.is_whitespace())
            .next()
            .unwrap_or("")
    };
    if boundary.is_empty() {
        return Err(Error::malformed("empty boundary in Content-Type header"));
    }
    Ok(boundary.to_string())
}

/// Single-file contract: the first part carrying a `filename` parameter wins.
pub fn extract_file(ctx: &RequestContext) -> Result<UploadedFile> {
    let files = extract_files(ctx)?;
    // extract_files already guarantees at least one entry
    Ok(files.into_iter().next().expect("non-empty file list"))
}

/// Multi-file contract: every file part, in body order.
pub fn extract_files(ctx: &RequestContext) -> Result<Vec<UploadedFile>> {
    let content_type = ctx
        .content_type
        .as_deref()
        .ok_or_else(|| Error::malformed("missing Content-Type header"))?;
    let boundary = extract_boundary(content_type)?;
    let delimiter = format!("--{boundary}").into_bytes();

    let mut files = Vec::new();
    for part in split_on(&ctx.body, &delimiter) {
        if let Some(file) = parse_part(part)? {
            files.push(file);
        }
    }
    if files.is_empty() {
        return Err(Error::malformed("no file found in multipart body"));
    }
    Ok(files)
}

/// Degraded fallback when the boundary cannot be determined at all: treat the
/// entire body as the file payload under a generated name. Lossy by design --
/// any form fields in the body end up inside the payload.
pub fn extract_file_lossy(ctx: &RequestContext) -> Result<UploadedFile> {
    if ctx.body.is_empty() {
        return Err(Error::malformed("empty request body"));
    }
    Ok(UploadedFile {
        content: ctx.body.clone(),
        filename: generated_filename(),
        content_type: ctx
            .content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    })
}

/// Batch-JSON variant: `{ "files": [{ "name", "data" (base64), "type" }] }`.
pub fn decode_json_batch(body: &[u8]) -> Result<Vec<UploadedFile>> {
    #[derive(Deserialize)]
    struct Entry {
        name: Option<String>,
        data: String,
        #[serde(rename = "type")]
        content_type: Option<String>,
    }
    #[derive(Deserialize)]
    struct Batch {
        files: Vec<Entry>,
    }

    let batch: Batch = serde_json::from_slice(body)
        .map_err(|e| Error::malformed(format!("invalid JSON batch body: {e}")))?;
    if batch.files.is_empty() {
        return Err(Error::malformed("JSON batch contains no files"));
    }

    let mut files = Vec::with_capacity(batch.files.len());
    for entry in batch.files {
        let content = BASE64_STANDARD
            .decode(&entry.data)
            .map_err(|e| Error::malformed(format!("file data is not valid base64: {e}")))?;
        if content.is_empty() {
            return Err(Error::malformed("file entry has empty content"));
        }
        files.push(UploadedFile {
            content,
            filename: entry
                .name
                .map(|n| sanitize_filename(&n))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(generated_filename),
            content_type: entry
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        });
    }
    Ok(files)
}

// ============================================================================
// Part scanning
// ============================================================================

/// Parse one boundary-delimited segment. Returns `None` for non-file parts
/// (form fields, preamble, terminal marker, malformed fragments).
fn parse_part(part: &[u8]) -> Result<Option<UploadedFile>> {
    let trimmed = trim_ascii(part);
    if trimmed.is_empty() || trimmed == b"--" {
        return Ok(None);
    }

    // Header block ends at the first blank line; parts without one are not
    // well-formed file parts and are skipped, not fatal.
    let Some(sep) = find(part, b"\r\n\r\n", 0) else {
        return Ok(None);
    };

    // Headers are ASCII; a lossless one-byte-per-char view is enough for
    // attribute scanning and never reinterprets payload bytes.
    let headers: String = part[..sep].iter().map(|&b| b as char).collect();
    let Some(filename) = disposition_filename(&headers) else {
        return Ok(None);
    };

    let content = trim_part_body(&part[sep + 4..]);
    if content.is_empty() {
        return Err(Error::malformed(format!(
            "file part '{filename}' has no content"
        )));
    }

    Ok(Some(UploadedFile {
        content: content.to_vec(),
        filename: {
            let name = sanitize_filename(&filename);
            if name.is_empty() {
                generated_filename()
            } else {
                name
            }
        },
        content_type: part_content_type(&headers)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    }))
}

/// `filename` parameter of the Content-Disposition header, quoted or bare.
fn disposition_filename(headers: &str) -> Option<String> {
    let lower = headers.to_ascii_lowercase();
    let line_start = lower.find("content-disposition")?;
    let from = lower[line_start..].find("filename=")? + line_start + "filename=".len();
    let rest = &headers[from..];
    let value = if let Some(stripped) = rest.strip_prefix('"') {
        stripped.split('"').next().unwrap_or("")
    } else {
        rest.split(|c: char| c == '"' || c == '\r' || c == '\n' || c == ';')
            .next()
            .unwrap_or("")
    };
    Some(value.trim().to_string())
}

/// The part's own Content-Type header, if declared.
fn part_content_type(headers: &str) -> Option<String> {
    let lower = headers.to_ascii_lowercase();
    for (line, lower_line) in headers.lines().zip(lower.lines()) {
        if lower_line.starts_with("content-type:") {
            let value = line["content-type:".len()..].trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Strip the CRLF that precedes the next boundary delimiter, plus any stray
/// terminal-marker remnant.
fn trim_part_body(mut body: &[u8]) -> &[u8] {
    if let Some(rest) = body.strip_suffix(b"\r\n--") {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix(b"\r\n") {
        body = rest;
    }
    body
}

/// Keep filenames safe for logs and temp paths: drop directory components,
/// replace control and separator characters.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .trim_matches('.');
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn generated_filename() -> String {
    format!("upload-{}.bin", Uuid::new_v4())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn split_on<'a>(body: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while let Some(idx) = find(body, delimiter, pos) {
        parts.push(&body[pos..idx]);
        pos = idx + delimiter.len();
    }
    parts.push(&body[pos..]);
    parts
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
