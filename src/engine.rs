//! DRM engine capability interface.
//!
//! The platform engine is an external collaborator: it owns the cipher, the
//! certificate store, and the key negotiation internals. This module defines
//! the trait surface the pipeline drives and the opaque payload types that
//! cross it.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::EngineError;

/// Content-protection scheme handed to the engine at construction.
pub const PROTECTION_SCHEME: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);

/// Opaque engine session handle.
pub type SessionId = Vec<u8>;

/// License key variants an engine can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Keys bound to the lifetime of the session.
    Streaming,
    /// Keys persisted as a key set for reuse without a new round trip.
    Offline,
    /// Release a previously persisted key set.
    Release,
}

/// A license request produced by the engine.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    /// Opaque request payload for the license server.
    pub data: Vec<u8>,
    /// Server-suggested URL; the engine only populates this on follow-up
    /// requests, which is where the heartbeat URL comes from.
    pub default_url: Option<String>,
}

/// A device provisioning request produced by the engine.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Opaque request payload for the provisioning server.
    pub data: Vec<u8>,
}

/// Asynchronous notifications delivered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmEvent {
    /// The device certificate is missing or invalidated.
    ProvisioningRequired,
    /// A key is needed for the current content.
    KeyRequired,
    /// A negotiated key has expired.
    KeyExpired,
    /// Vendor-defined notification code.
    VendorDefined(i32),
}

/// Platform DRM engine capability.
///
/// Implementations wrap the vendor engine. Session handles returned by
/// [`open_session`](DrmEngine::open_session) must not be used concurrently
/// by two callers; everything else on the trait may be called from any
/// thread.
pub trait DrmEngine: Send + Sync {
    /// Open a new engine session.
    fn open_session(&self) -> Result<SessionId, EngineError>;

    /// Close a session. The handle is invalid afterwards.
    fn close_session(&self, session_id: &[u8]) -> Result<(), EngineError>;

    /// Build a license request for the given content identification.
    fn key_request(
        &self,
        session_id: &[u8],
        pssh: &[u8],
        mime_type: &str,
        key_type: KeyType,
    ) -> Result<KeyRequest, EngineError>;

    /// Consume a license server response, returning the negotiated key set.
    fn provide_key_response(
        &self,
        session_id: &[u8],
        response: &[u8],
    ) -> Result<Vec<u8>, EngineError>;

    /// Restore a previously negotiated key set into the session.
    fn restore_keys(&self, session_id: &[u8], key_set_id: &[u8]) -> Result<(), EngineError>;

    /// Build a device provisioning request.
    fn provision_request(&self) -> Result<ProvisionRequest, EngineError>;

    /// Consume a provisioning server response.
    fn provide_provision_response(&self, response: &[u8]) -> Result<(), EngineError>;

    /// Open a crypto sub-session bound to a cipher/MAC algorithm pairing.
    fn crypto_session(
        &self,
        session_id: &[u8],
        cipher: &str,
        mac: &str,
    ) -> Result<Box<dyn CryptoSession>, EngineError>;

    /// Wait up to `timeout` for the next engine event.
    fn poll_event(&self, timeout: Duration) -> Option<DrmEvent>;
}

/// Session-scoped bulk cipher handle.
pub trait CryptoSession {
    /// Encrypt `data` under the key identified by `key_id`.
    fn encrypt(&self, key_id: &[u8], data: &[u8], iv: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Decrypt `data` under the key identified by `key_id`.
    fn decrypt(&self, key_id: &[u8], data: &[u8], iv: &[u8]) -> Result<Vec<u8>, EngineError>;
}

impl<E: DrmEngine + ?Sized> DrmEngine for Arc<E> {
    fn open_session(&self) -> Result<SessionId, EngineError> {
        (**self).open_session()
    }

    fn close_session(&self, session_id: &[u8]) -> Result<(), EngineError> {
        (**self).close_session(session_id)
    }

    fn key_request(
        &self,
        session_id: &[u8],
        pssh: &[u8],
        mime_type: &str,
        key_type: KeyType,
    ) -> Result<KeyRequest, EngineError> {
        (**self).key_request(session_id, pssh, mime_type, key_type)
    }

    fn provide_key_response(
        &self,
        session_id: &[u8],
        response: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        (**self).provide_key_response(session_id, response)
    }

    fn restore_keys(&self, session_id: &[u8], key_set_id: &[u8]) -> Result<(), EngineError> {
        (**self).restore_keys(session_id, key_set_id)
    }

    fn provision_request(&self) -> Result<ProvisionRequest, EngineError> {
        (**self).provision_request()
    }

    fn provide_provision_response(&self, response: &[u8]) -> Result<(), EngineError> {
        (**self).provide_provision_response(response)
    }

    fn crypto_session(
        &self,
        session_id: &[u8],
        cipher: &str,
        mac: &str,
    ) -> Result<Box<dyn CryptoSession>, EngineError> {
        (**self).crypto_session(session_id, cipher, mac)
    }

    fn poll_event(&self, timeout: Duration) -> Option<DrmEvent> {
        (**self).poll_event(timeout)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{CryptoSession, DrmEngine, DrmEvent, KeyRequest, KeyType, ProvisionRequest, SessionId};
    use crate::error::EngineError;

    /// Scripted in-memory engine.
    ///
    /// Each `*_results` queue is drained front-first; an empty queue falls
    /// back to a success default. Call counters and captured arguments let
    /// tests assert on the exact engine traffic.
    #[derive(Default)]
    pub(crate) struct MockEngine {
        pub open_results: Mutex<VecDeque<Result<SessionId, EngineError>>>,
        pub key_request_results: Mutex<VecDeque<Result<KeyRequest, EngineError>>>,
        pub key_response_results: Mutex<VecDeque<Result<Vec<u8>, EngineError>>>,
        pub restore_results: Mutex<VecDeque<Result<(), EngineError>>>,
        pub events: Mutex<VecDeque<DrmEvent>>,

        pub open_calls: AtomicUsize,
        pub key_request_calls: AtomicUsize,
        pub provision_request_calls: AtomicUsize,
        pub poll_calls: AtomicUsize,

        pub provision_responses: Mutex<Vec<Vec<u8>>>,
        pub key_responses: Mutex<Vec<Vec<u8>>>,
        pub restored: Mutex<Vec<Vec<u8>>>,
        pub closed: Mutex<Vec<SessionId>>,

        /// (key_id, data, iv) triples seen by the crypto sub-session.
        pub crypto_calls: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>>>,
        /// Fixed crypto output; `None` echoes the input back.
        pub crypto_output: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_open(&self, result: Result<SessionId, EngineError>) {
            self.open_results.lock().unwrap().push_back(result);
        }

        pub fn push_key_request(&self, result: Result<KeyRequest, EngineError>) {
            self.key_request_results.lock().unwrap().push_back(result);
        }

        pub fn push_key_response(&self, result: Result<Vec<u8>, EngineError>) {
            self.key_response_results.lock().unwrap().push_back(result);
        }

        pub fn set_crypto_output(&self, output: Vec<u8>) {
            *self.crypto_output.lock().unwrap() = Some(output);
        }
    }

    impl DrmEngine for MockEngine {
        fn open_session(&self) -> Result<SessionId, EngineError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            self.open_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(b"session-1".to_vec()))
        }

        fn close_session(&self, session_id: &[u8]) -> Result<(), EngineError> {
            self.closed.lock().unwrap().push(session_id.to_vec());
            Ok(())
        }

        fn key_request(
            &self,
            _session_id: &[u8],
            _pssh: &[u8],
            _mime_type: &str,
            _key_type: KeyType,
        ) -> Result<KeyRequest, EngineError> {
            self.key_request_calls.fetch_add(1, Ordering::SeqCst);
            self.key_request_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(KeyRequest {
                        data: b"license-request".to_vec(),
                        default_url: None,
                    })
                })
        }

        fn provide_key_response(
            &self,
            _session_id: &[u8],
            response: &[u8],
        ) -> Result<Vec<u8>, EngineError> {
            self.key_responses.lock().unwrap().push(response.to_vec());
            self.key_response_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(b"key-set-1".to_vec()))
        }

        fn restore_keys(&self, _session_id: &[u8], key_set_id: &[u8]) -> Result<(), EngineError> {
            self.restored.lock().unwrap().push(key_set_id.to_vec());
            self.restore_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        fn provision_request(&self) -> Result<ProvisionRequest, EngineError> {
            self.provision_request_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionRequest {
                data: b"provision-request".to_vec(),
            })
        }

        fn provide_provision_response(&self, response: &[u8]) -> Result<(), EngineError> {
            self.provision_responses.lock().unwrap().push(response.to_vec());
            Ok(())
        }

        fn crypto_session(
            &self,
            _session_id: &[u8],
            _cipher: &str,
            _mac: &str,
        ) -> Result<Box<dyn CryptoSession>, EngineError> {
            Ok(Box::new(MockCryptoSession {
                calls: Arc::clone(&self.crypto_calls),
                output: Arc::clone(&self.crypto_output),
            }))
        }

        fn poll_event(&self, timeout: Duration) -> Option<DrmEvent> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(event) = self.events.lock().unwrap().pop_front() {
                return Some(event);
            }
            std::thread::sleep(timeout);
            None
        }
    }

    pub(crate) struct MockCryptoSession {
        calls: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>>>,
        output: Arc<Mutex<Option<Vec<u8>>>>,
    }

    impl CryptoSession for MockCryptoSession {
        fn encrypt(&self, key_id: &[u8], data: &[u8], iv: &[u8]) -> Result<Vec<u8>, EngineError> {
            self.record(key_id, data, iv)
        }

        fn decrypt(&self, key_id: &[u8], data: &[u8], iv: &[u8]) -> Result<Vec<u8>, EngineError> {
            self.record(key_id, data, iv)
        }
    }

    impl MockCryptoSession {
        fn record(&self, key_id: &[u8], data: &[u8], iv: &[u8]) -> Result<Vec<u8>, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push((key_id.to_vec(), data.to_vec(), iv.to_vec()));
            match self.output.lock().unwrap().clone() {
                Some(output) => Ok(output),
                None => Ok(data.to_vec()),
            }
        }
    }
}
