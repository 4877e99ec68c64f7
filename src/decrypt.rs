//! Resource decryption pipeline.
//!
//! Ties the pieces together: the engine worker supplies the engine, the
//! session manager supplies a session, the key-set cache or the license
//! orchestrator supplies keys, and the engine's crypto sub-session turns
//! ciphertext into cleartext.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};

use crate::cache::KeySetCache;
use crate::config::PipelineConfig;
use crate::engine::{DrmEngine, KeyType};
use crate::error::{DecryptError, EngineError};
use crate::events::EngineWorker;
use crate::http::HttpTransactor;
use crate::license::LicenseOrchestrator;
use crate::provision::ProvisioningClient;
use crate::session::SessionManager;

/// Cipher block size; encrypted payloads are padded to this boundary.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Bulk cipher the crypto sub-session is bound to.
const CIPHER_ALGORITHM: &str = "AES/CBC/NoPadding";

/// MAC algorithm the crypto sub-session is bound to.
const MAC_ALGORITHM: &str = "HmacSHA256";

enum Direction {
    Encrypt,
    Decrypt,
}

/// DRM-gated resource transformation pipeline.
///
/// One instance owns an engine worker and may serve many resources; the
/// key-set cache passed at start is shared with whoever else holds it.
pub struct ResourceDecryptor<E: DrmEngine + 'static> {
    worker: Option<EngineWorker<E>>,
    sessions: SessionManager,
    licenses: LicenseOrchestrator,
    key_sets: KeySetCache,
    key_id: Vec<u8>,
    iv: Vec<u8>,
    short_reads: AtomicU64,
}

impl<E: DrmEngine + 'static> ResourceDecryptor<E> {
    /// Start the pipeline: build the HTTP plumbing and spin up the engine
    /// worker.
    ///
    /// A failed engine start is not an error here; callers find out at use
    /// time, via [`DecryptError::EngineNotReady`]. The only start failure
    /// is an HTTP client that cannot be built. The factory receives the
    /// configured protection scheme on the worker thread.
    pub fn start<F>(
        config: PipelineConfig,
        key_sets: KeySetCache,
        factory: F,
    ) -> Result<Self, DecryptError>
    where
        F: FnOnce(uuid::Uuid) -> Result<E, EngineError> + Send + 'static,
    {
        let transactor = HttpTransactor::new()?;
        let provisioner =
            ProvisioningClient::new(config.provisioning_server_url, transactor.clone());
        let licenses = LicenseOrchestrator::new(
            config.license_server_url,
            config.pssh,
            config.mime_type,
            transactor,
            provisioner.clone(),
        );
        let sessions = SessionManager::new(provisioner);

        let scheme = config.scheme;
        let worker = match EngineWorker::start(move || factory(scheme)) {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!("engine worker failed to start: {}", e);
                None
            }
        };

        Ok(Self {
            worker,
            sessions,
            licenses,
            key_sets,
            key_id: config.key_id,
            iv: config.iv,
            short_reads: AtomicU64::new(0),
        })
    }

    /// Stop the engine worker. Decrypt calls fail with
    /// [`DecryptError::EngineNotReady`] afterwards.
    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    /// Decrypt a protected resource stream.
    ///
    /// Returns the cleartext bytes and their true length as reported by the
    /// engine. A zero-length result means the content is not viewable; the
    /// caller must fail safe rather than interpret it.
    pub fn decrypt(
        &self,
        resource: &mut dyn Read,
        declared_length: usize,
    ) -> Result<(Vec<u8>, usize), DecryptError> {
        self.transform(resource, declared_length, Direction::Decrypt)
    }

    /// Encrypt a cleartext resource stream, the asset-preparation
    /// counterpart of [`decrypt`](Self::decrypt). Same session and key-set
    /// lifecycle, same padding.
    pub fn encrypt(
        &self,
        resource: &mut dyn Read,
        declared_length: usize,
    ) -> Result<(Vec<u8>, usize), DecryptError> {
        self.transform(resource, declared_length, Direction::Encrypt)
    }

    /// Times a resource stream ended before its declared length.
    pub fn short_read_count(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }

    /// Heartbeat URL captured during license acquisition, if any.
    pub fn default_heartbeat_url(&self) -> Option<String> {
        self.licenses.default_heartbeat_url()
    }

    fn transform(
        &self,
        resource: &mut dyn Read,
        declared_length: usize,
        direction: Direction,
    ) -> Result<(Vec<u8>, usize), DecryptError> {
        let worker = self.worker.as_ref().ok_or(DecryptError::EngineNotReady)?;
        let engine = worker.engine();

        let session_id = self.sessions.open(&engine)?;
        let result =
            self.transform_in_session(&engine, &session_id, resource, declared_length, direction);
        // The session is released regardless of the crypto outcome.
        self.sessions.close(&engine, &session_id);
        result
    }

    fn transform_in_session(
        &self,
        engine: &dyn DrmEngine,
        session_id: &[u8],
        resource: &mut dyn Read,
        declared_length: usize,
        direction: Direction,
    ) -> Result<(Vec<u8>, usize), DecryptError> {
        self.resolve_key_set(engine, session_id)?;

        let crypto = engine
            .crypto_session(session_id, CIPHER_ALGORITHM, MAC_ALGORITHM)
            .map_err(DecryptError::Engine)?;

        let mut data = vec![0u8; padded_length(declared_length)];
        self.read_resource(resource, &mut data, declared_length);

        let output = match direction {
            Direction::Decrypt => crypto.decrypt(&self.key_id, &data, &self.iv),
            Direction::Encrypt => crypto.encrypt(&self.key_id, &data, &self.iv),
        }
        .map_err(DecryptError::Engine)?;

        let length = output.len();
        if length == 0 {
            warn!("bulk transform produced no output");
        }
        debug!("transformed {} padded bytes into {}", data.len(), length);
        Ok((output, length))
    }

    /// Restore the cached key set, or negotiate a fresh one and publish it.
    fn resolve_key_set(
        &self,
        engine: &dyn DrmEngine,
        session_id: &[u8],
    ) -> Result<(), DecryptError> {
        match self.key_sets.get() {
            Some(key_set_id) => {
                debug!("restoring cached key set ({} bytes)", key_set_id.len());
                engine
                    .restore_keys(session_id, &key_set_id)
                    .map_err(DecryptError::Engine)?;
            }
            None => {
                let key_set_id =
                    self.licenses
                        .acquire_key_set(engine, session_id, KeyType::Offline)?;
                if key_set_id.is_empty() {
                    // Denied by the server; content stays non-viewable.
                    warn!("license transaction yielded no key set");
                } else {
                    self.key_sets.publish(&key_set_id);
                }
            }
        }
        Ok(())
    }

    /// Fill `data[..declared_length]` from the resource stream.
    ///
    /// Short reads and read errors are tolerated: the remainder stays
    /// zeroed and the short-read counter increments so the condition is
    /// observable.
    fn read_resource(&self, resource: &mut dyn Read, data: &mut [u8], declared_length: usize) {
        let mut filled = 0usize;
        while filled < declared_length {
            match resource.read(&mut data[filled..declared_length]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("resource read error after {} bytes: {}", filled, e);
                    break;
                }
            }
        }
        if filled < declared_length {
            warn!("short read: {} of {} declared bytes", filled, declared_length);
            self.short_reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Round `declared_length` up to the next cipher block boundary.
#[must_use]
fn padded_length(declared_length: usize) -> usize {
    declared_length.div_ceil(CIPHER_BLOCK_SIZE) * CIPHER_BLOCK_SIZE
}
