//! Device provisioning round trip.
//!
//! A device without a valid certificate cannot build license requests or
//! open sessions. When the engine signals that state, one provisioning
//! exchange fetches a certificate: engine request, POST to the provisioning
//! server, envelope unwrap, response back into the engine.

use log::{debug, info};

use crate::engine::DrmEngine;
use crate::envelope::unwrap_response;
use crate::error::ProvisionError;
use crate::http::HttpTransactor;

/// One-shot provisioning client.
#[derive(Debug, Clone)]
pub struct ProvisioningClient {
    url: String,
    transactor: HttpTransactor,
}

impl ProvisioningClient {
    pub fn new(url: impl Into<String>, transactor: HttpTransactor) -> Self {
        Self {
            url: url.into(),
            transactor,
        }
    }

    /// Perform exactly one provisioning exchange.
    ///
    /// Whether and when to retry is the caller's decision; the recoverable
    /// conditions differ between session open and license acquisition.
    pub fn provision(&self, engine: &dyn DrmEngine) -> Result<(), ProvisionError> {
        let request = engine.provision_request()?;
        debug!("provisioning request: {} bytes", request.data.len());

        let (_status, body) = self.transactor.post(&self.url, Some(&request.data), &[])?;
        let payload = unwrap_response(&body)?;

        engine.provide_provision_response(payload)?;
        info!("device provisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ProvisioningClient;
    use crate::engine::mock::MockEngine;
    use crate::error::ProvisionError;
    use crate::http::HttpTransactor;

    fn client(server: &mockito::ServerGuard) -> ProvisioningClient {
        ProvisioningClient::new(
            format!("{}/provision", server.url()),
            HttpTransactor::new().expect("client"),
        )
    }

    #[test]
    fn provisioning_round_trip_unwraps_the_envelope() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/provision")
            .match_body("provision-request")
            .with_status(200)
            .with_body("GLS/1.0\r\n\r\ncertificate")
            .create();

        let engine = MockEngine::new();
        client(&server).provision(&engine).expect("provision");

        let responses = engine.provision_responses.lock().unwrap();
        assert_eq!(responses.as_slice(), &[b"certificate".to_vec()]);
        mock.assert();
    }

    #[test]
    fn raw_provisioning_response_passes_through() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/provision")
            .with_status(200)
            .with_body("raw-certificate")
            .create();

        let engine = MockEngine::new();
        client(&server).provision(&engine).expect("provision");

        let responses = engine.provision_responses.lock().unwrap();
        assert_eq!(responses.as_slice(), &[b"raw-certificate".to_vec()]);
        mock.assert();
    }

    #[test]
    fn transport_failure_surfaces() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("POST", "/provision").with_status(500).create();

        let engine = MockEngine::new();
        let err = client(&server).provision(&engine).unwrap_err();
        assert!(matches!(err, ProvisionError::Transport(_)));
        assert!(engine.provision_responses.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_envelope_surfaces() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/provision")
            .with_status(200)
            .with_body("GLS/2.0\r\n\r\ncert")
            .create();

        let engine = MockEngine::new();
        let err = client(&server).provision(&engine).unwrap_err();
        assert!(matches!(err, ProvisionError::Parse(_)));
    }
}
