//! Invoice Submit CLI Tool
//!
//! Simple command-line tool for sending an invoice to the extraction service.
//!
//! Usage:
//!   submit <invoice.pdf>        # Parse and validate one invoice
//!   submit --ocr <invoice.pdf>  # Force OCR mode for image-only scans
//!
//! Environment variables:
//!   LLAMA_CLOUD_API_KEY   # Required bearer secret
//!   PARSE_BASE_URL        # Service base URL
//!   PARSE_FALLBACK_ADDR   # Alternate address for DNS outages
//!   POLL_INTERVAL_MS=2000 # Delay between job status checks
//!   POLL_MAX_ATTEMPTS=60  # Poll budget before giving up

use invoice_ocr_rs::{
    config::AppConfig,
    dispatch::{Dispatcher, HttpTransport},
    job::await_result,
    multipart::UploadedFile,
};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let (invoice_path, force_ocr) = if args.len() == 2 {
        (PathBuf::from(&args[1]), false)
    } else if args.len() == 3 && args[1] == "--ocr" {
        (PathBuf::from(&args[2]), true)
    } else {
        eprintln!("Usage:");
        eprintln!("  {} <invoice.(pdf|png|jpg)>", args[0]);
        eprintln!("  {} --ocr <invoice.(pdf|png|jpg)>  (force OCR)", args[0]);
        std::process::exit(1);
    };

    if !invoice_path.exists() {
        eprintln!("❌ File not found: {:?}", invoice_path);
        std::process::exit(1);
    }

    let config = AppConfig::from_env()?;
    let content = tokio::fs::read(&invoice_path).await?;
    let file = UploadedFile {
        filename: invoice_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "invoice.pdf".to_string()),
        content_type: guess_content_type(&invoice_path).to_string(),
        content,
    };

    println!("📄 Submitting: {:?}", invoice_path);
    println!("⚙️  Config:");
    println!("   Service: {}", config.service.base_url);
    println!("   Language: {}", config.service.language);
    println!("   Premium mode: {}", config.service.premium_mode);
    println!("   Force OCR: {}", force_ocr);

    let transport = HttpTransport::new(config.service.clone())?;
    let dispatcher = Dispatcher::new(transport, &config.service);

    let start = Instant::now();
    let job = dispatcher.submit(&file, force_ocr).await?;
    println!("⏳ Job accepted: {} (via {:?})", job.id, job.endpoint);

    let result = await_result(dispatcher.transport(), &job, &config.poll).await?;
    let elapsed = start.elapsed();

    let out_path = invoice_path.with_extension("json");
    tokio::fs::write(&out_path, serde_json::to_vec_pretty(&result)?).await?;

    println!("\n✅ Parsed in {:.2}s", elapsed.as_secs_f64());
    println!("📝 Output: {:?}", out_path);

    Ok(())
}

fn guess_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "application/octet-stream",
    }
}
