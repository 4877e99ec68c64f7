//! Single-transaction HTTP client for license and provisioning servers.

use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;

use crate::error::TransportError;

/// Connect and read bound per transaction. License and provisioning servers
/// are third-party; they must not block the caller indefinitely.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_millis(6000);

/// Blocking POST transactor.
///
/// Performs exactly one transaction per call and never retries: retry
/// policy differs by caller and stays with them. Connection resources are
/// released on every exit path.
#[derive(Debug, Clone)]
pub struct HttpTransactor {
    client: Client,
}

impl HttpTransactor {
    /// Build a transactor with the fixed connect/read timeouts.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(TRANSPORT_TIMEOUT)
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    /// Execute a POST and return the status code with the full response
    /// body. Non-2xx statuses are reported as [`TransportError::Status`].
    pub fn post(
        &self,
        url: &str,
        body: Option<&[u8]>,
        headers: &[(&str, &str)],
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request.send().map_err(|e| TransportError::Http {
            url: url.to_string(),
            source: e,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().map_err(|e| TransportError::Http {
            url: url.to_string(),
            source: e,
        })?;
        debug!("POST {} -> {} ({} bytes)", url, status.as_u16(), body.len());
        Ok((status.as_u16(), body.to_vec()))
    }
}
