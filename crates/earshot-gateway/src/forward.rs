//! Proxy helper for routes that front the tool-call backend.
//!
//! Only connection-class failures are retried: refused/reset/aborted
//! connections, broken pipes, and socket timeouts. An HTTP response of any
//! status, 4xx and 5xx included, is upstream's answer and is surfaced
//! unchanged.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use tracing::warn;

use earshot_core::EarshotError;

pub const FORWARD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: String,
}

pub async fn forward_to_backend(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<&Value>,
) -> Result<ForwardResponse, EarshotError> {
    let mut last_err: Option<reqwest::Error> = None;

    for attempt in 1..=FORWARD_ATTEMPTS {
        let mut req = client.request(method.clone(), url);
        if let Some(body) = body {
            req = req.json(body);
        }

        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Ok(ForwardResponse { status, body });
            }
            Err(e) if is_connection_error(&e) && attempt < FORWARD_ATTEMPTS => {
                warn!(attempt, %url, "backend connection error, retrying: {e}");
                last_err = Some(e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) if is_connection_error(&e) => {
                last_err = Some(e);
            }
            // Non-retriable failure classes fail fast.
            Err(e) => return Err(EarshotError::Internal(e.to_string())),
        }
    }

    Err(EarshotError::BackendUnavailable(format!(
        "{url} unavailable: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Connection-class errors only (the retriable set).
pub fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    // Walk the source chain for the raw I/O error kinds.
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            );
        }
        source = std::error::Error::source(inner);
    }
    false
}
