//! Shared HTTP plumbing for the REST adapters.

use std::time::Duration;

use reqwest::Response;

use crate::error::BackendError;
use crate::BackendResult;

/// Upper bound for one request, including reading the response body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client with our user agent, optionally trusting one extra CA.
///
/// Every request fails after `timeout`, so a hung server cannot stall a
/// reconciliation worker.
pub(crate) fn http_client(
    ca_pem: Option<&[u8]>,
    timeout: Duration,
) -> BackendResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("cert-shim/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout));
    if let Some(pem) = ca_pem {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
    }
    Ok(builder.build()?)
}

/// Turn a non-success status into [`BackendError::Status`].
pub(crate) async fn check(
    response: Response,
    method: &'static str,
    url: &str,
) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_short_timeouts() {
        assert!(http_client(None, Duration::from_millis(100)).is_ok());
        assert!(CONNECT_TIMEOUT < REQUEST_TIMEOUT);
    }
}
