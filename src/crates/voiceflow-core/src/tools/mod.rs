//! Outbound collaborators used by the tool nodes
//!
//! Each collaborator is a trait with an HTTP implementation built on
//! `reqwest` and an in-process implementation for tests and offline runs:
//!
//! | Trait          | HTTP               | Offline            |
//! |----------------|--------------------|--------------------|
//! | [`InitClient`] | [`HttpInitClient`] | [`StaticInitClient`] |
//! | [`KbSearch`]   | [`HttpKbSearch`]   | [`StaticKbSearch`]   |
//!
//! HTTP calls go through the configured [`RetryPolicy`](crate::retry::RetryPolicy).
//! Rate limiting, server errors and transport failures are retried; any other
//! non-success status is returned straight away as
//! [`WorkflowError::External`].

mod init;
mod kb;

pub use init::{CallContext, HttpInitClient, InitClient, StaticInitClient};
pub use kb::{HttpKbSearch, KbQuery, KbSearch, StaticKbSearch};

use crate::error::{Result, WorkflowError};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

pub(crate) fn is_retryable(err: &WorkflowError) -> bool {
    matches!(err, WorkflowError::Http(_) | WorkflowError::Timeout(_))
}

/// Map a response to its JSON body, classifying failures for retry
pub(crate) async fn read_json(response: Response, what: &str) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(WorkflowError::Http(format!("{} returned {}", what, status)));
    }
    if !status.is_success() {
        return Err(WorkflowError::External(format!("{} returned {}", what, status)));
    }
    Ok(response.json::<Value>().await?)
}
