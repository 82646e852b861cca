//! reqwest-backed service implementations

mod accelerator;
mod network;
mod placement;

pub use accelerator::HttpAccelerator;
pub use network::HttpNetwork;
pub use placement::HttpPlacement;

use placemend_core::{PlacemendError, PlacemendResult, Service};
use reqwest::{Response, StatusCode};
use std::time::Duration;

/// Build a client with the given timeout
pub(crate) fn build_client(service: Service, timeout_secs: u64) -> PlacemendResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PlacemendError::Config(format!("Failed to create {} HTTP client: {}", service, e)))
}

/// Join a base endpoint and a path without doubling slashes
pub(crate) fn join(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Map a transport error
pub(crate) fn transport_error(service: Service, err: reqwest::Error) -> PlacemendError {
    PlacemendError::unavailable(service, err.to_string())
}

/// Map a non-success status to an error, passing success responses through
pub(crate) async fn check_status(
    service: Service,
    what: &str,
    response: Response,
) -> PlacemendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, body.trim());
    Err(match status {
        StatusCode::NOT_FOUND => PlacemendError::NotFound(message),
        StatusCode::CONFLICT => PlacemendError::Conflict(message),
        s if s.is_server_error() => PlacemendError::unavailable(service, message),
        _ => PlacemendError::InvalidResponse { service, message },
    })
}

/// Decode a JSON body
pub(crate) async fn json<T: serde::de::DeserializeOwned>(
    service: Service,
    response: Response,
) -> PlacemendResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| PlacemendError::InvalidResponse {
            service,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("http://h:8778/", "/allocations/x"), "http://h:8778/allocations/x");
        assert_eq!(join("http://h:8778", "resource_providers"), "http://h:8778/resource_providers");
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(Service::Ledger, 5).is_ok());
    }
}
