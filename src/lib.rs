//! Invoice OCR Library - Shared processing logic
//!
//! This library contains the core invoice processing functionality used by:
//! - API server (main.rs)
//! - CLI tool (bin/submit.rs)
//!
//! The pipeline: raw request body -> multipart extraction -> resilient
//! dispatch to the cloud extraction service -> job polling -> schema
//! validation -> structured invoice data.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod invoice;
pub mod job;
pub mod multipart;
pub mod workflow;

pub use config::{AppConfig, ServiceConfig};
pub use dispatch::{Dispatcher, HttpTransport, Transport};
pub use error::{Error, Result};
pub use invoice::{InvoiceData, LineItem};
pub use job::{JobStatus, PollConfig};
pub use multipart::{RequestContext, UploadedFile};
pub use workflow::{BatchReport, FileOutcome, Workflow};
