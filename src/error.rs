//! Error types for drmgate.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a platform DRM engine implementation.
///
/// The pipeline only reacts to the first three variants; everything else the
/// engine wants to say goes through `Other`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The device has no valid certificate; provisioning is required.
    #[error("device is not provisioned")]
    NotProvisioned,

    /// Transient engine-side contention; retry after a backoff.
    #[error("engine session resources are busy")]
    ResourceBusy,

    /// The license server refused the key request.
    #[error("request denied by server")]
    DeniedByServer,

    /// Any other engine-side failure.
    #[error("{0}")]
    Other(String),
}

/// Errors from a single HTTP transaction.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client itself could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Connect failure, timeout, or a broken response stream.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered outside the 2xx range.
    #[error("request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Errors from unwrapping a server response envelope.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The envelope version is not 1.x.
    #[error("invalid server version, expected 1.x")]
    UnsupportedVersion,

    /// The envelope carries no message delimiter.
    #[error("invalid server response, could not locate message payload")]
    MalformedEnvelope,
}

/// Errors from a device provisioning exchange.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The engine rejected one side of the exchange.
    #[error("engine rejected the provisioning exchange: {0}")]
    Engine(#[from] EngineError),

    /// The provisioning server was unreachable or unhappy.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The provisioning response envelope was malformed.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The open-attempt budget was exhausted by busy or provisioning
    /// failures; no session exists.
    #[error("failed to provision a usable session")]
    ProvisioningFailed,

    /// The engine worker did not signal readiness in time.
    #[error("engine did not become ready within {0:?}")]
    StartTimeout(Duration),

    /// The engine factory failed before signaling readiness.
    #[error("engine startup failed")]
    StartFailed,

    /// A terminal engine-side failure during open.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Errors from license acquisition.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// No license request could be built, even after reprovisioning.
    #[error("failed to build a license request")]
    RequestFailed,

    /// The transaction worker rejected or lost the submission.
    #[error("failed to submit the license transaction")]
    SubmissionFailed,

    /// The server envelope was malformed; retrying cannot help.
    #[error("bad license server response: {0}")]
    BadServerResponse(#[from] ParseError),

    /// The transaction attempt budget was exhausted.
    #[error("license transaction timed out")]
    Timeout,
}

/// Errors from the resource decryption pipeline.
#[derive(Debug, Error)]
pub enum DecryptError {
    /// The engine worker was never started or failed to start.
    #[error("DRM engine is not ready")]
    EngineNotReady,

    /// The pipeline's HTTP client could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session lifecycle failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// License acquisition failure.
    #[error(transparent)]
    License(#[from] LicenseError),

    /// The engine failed restoring keys or running the bulk cipher.
    #[error("engine error: {0}")]
    Engine(EngineError),
}
