//! Polling loop for asynchronous parse jobs.
//!
//! The service returns a job id on upload; the result only exists once the
//! job reaches a terminal status. The loop is bounded: at most
//! `max_attempts` status fetches, one `interval` sleep between them.

use crate::dispatch::{ParseJob, Transport, WireError};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
    TimedOut,
}

impl JobStatus {
    /// Map the service's status strings onto the state machine. Unknown
    /// non-terminal strings are treated as still running rather than failing
    /// the request.
    pub fn parse(raw: &str) -> JobStatus {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => JobStatus::Queued,
            "RUNNING" | "IN_PROGRESS" => JobStatus::Running,
            "SUCCESS" | "COMPLETED" => JobStatus::Completed,
            "ERROR" | "FAILED" => JobStatus::Failed,
            "CANCELLED" | "CANCELED" => JobStatus::Cancelled,
            "EXPIRED" => JobStatus::Expired,
            "TIMED_OUT" | "TIMEDOUT" => JobStatus::TimedOut,
            _ => JobStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

fn status_path(job: &ParseJob) -> String {
    format!("/api/v1/parsing/job/{}", job.id)
}

fn result_path(job: &ParseJob) -> String {
    format!("/api/v1/parsing/job/{}/result/json", job.id)
}

// Polling never switches routes: the job was accepted on one endpoint and a
// mid-poll connectivity blip is surfaced, not re-dispatched.
fn poll_wire_error(err: WireError) -> Error {
    if err.is_connectivity() {
        Error::UpstreamUnavailable {
            primary: err.message,
            fallback: "not retried while polling".to_string(),
        }
    } else {
        Error::UpstreamError {
            status: 0,
            detail: err.message,
        }
    }
}

/// Wait for `job` to finish and fetch its JSON result document.
pub async fn await_result<T: Transport>(
    transport: &T,
    job: &ParseJob,
    config: &PollConfig,
) -> Result<Value> {
    for attempt in 1..=config.max_attempts {
        let response = transport
            .fetch(job.endpoint, &status_path(job))
            .await
            .map_err(poll_wire_error)?;
        if !response.is_success() {
            return Err(Error::UpstreamError {
                status: response.status,
                detail: response.body,
            });
        }

        #[derive(Deserialize)]
        struct StatusBody {
            status: String,
        }
        let body: StatusBody =
            serde_json::from_str(&response.body).map_err(|e| Error::UpstreamError {
                status: response.status,
                detail: format!("status response is not valid JSON: {e}"),
            })?;

        let status = JobStatus::parse(&body.status);
        tracing::debug!(job_id = %job.id, attempt, status = ?status, "poll");

        match status {
            JobStatus::Completed => return fetch_result(transport, job).await,
            JobStatus::Queued | JobStatus::Running => {
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.interval).await;
                }
            }
            terminal => {
                return Err(Error::UpstreamError {
                    status: response.status,
                    detail: format!("parse job {} ended as {terminal:?}", job.id),
                })
            }
        }
    }

    Err(Error::ProcessingTimeout {
        attempts: config.max_attempts,
    })
}

async fn fetch_result<T: Transport>(transport: &T, job: &ParseJob) -> Result<Value> {
    let response = transport
        .fetch(job.endpoint, &result_path(job))
        .await
        .map_err(poll_wire_error)?;
    if !response.is_success() {
        return Err(Error::UpstreamError {
            status: response.status,
            detail: response.body,
        });
    }
    serde_json::from_str(&response.body).map_err(|e| Error::UpstreamError {
        status: response.status,
        detail: format!("result document is not valid JSON: {e}"),
    })
}
