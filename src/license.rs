//! License acquisition orchestration.
//!
//! Drives the engine's license request/response exchange against the
//! license server: builds the request, transacts it on a bounded worker,
//! feeds the response back to the engine, and retries across the
//! recoverable failure set. The retry structure is an explicit state
//! machine with per-state attempt counters.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::engine::{DrmEngine, KeyType};
use crate::envelope::unwrap_response;
use crate::error::{EngineError, LicenseError, TransportError};
use crate::http::HttpTransactor;
use crate::provision::ProvisioningClient;

/// Caller-side bound on one license transaction, measured from submission.
/// Independent of the transport's own socket timeouts.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(6500);

/// Full transaction attempts before giving up.
const MAX_TRANSACTION_ATTEMPTS: u32 = 3;

/// Request-construction attempts per acquisition.
const MAX_REQUEST_ATTEMPTS: u32 = 3;

/// Grace window for each phase of worker shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(3000);

/// Orchestrates license acquisition for one content identification.
pub struct LicenseOrchestrator {
    server_url: String,
    pssh: Vec<u8>,
    mime_type: String,
    transactor: HttpTransactor,
    provisioner: ProvisioningClient,
    transaction_timeout: Duration,
    default_heartbeat_url: Mutex<Option<String>>,
}

/// Acquisition states. Attempt counters live beside the state loop.
enum State {
    Idle,
    Requesting,
    Provisioning,
    Transacting { request: Vec<u8> },
    Done { key_set_id: Vec<u8> },
    Failed(LicenseError),
}

/// Result of one transaction attempt.
enum Outcome {
    Done(Vec<u8>),
    Retry(RetryReason),
    Fatal(LicenseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryReason {
    /// The worker slot was saturated.
    Rejected,
    /// The caller-side transaction timeout elapsed.
    TimedOut,
    /// The server returned an empty body.
    EmptyResponse,
    /// The server was unreachable or answered outside 2xx.
    TransportFailed,
    /// The response invalidated the certificate.
    Reprovisioned,
}

impl RetryReason {
    fn exhausted(self) -> LicenseError {
        match self {
            RetryReason::Rejected => LicenseError::SubmissionFailed,
            _ => LicenseError::Timeout,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RetryReason::Rejected => "worker rejected the submission",
            RetryReason::TimedOut => "transaction timed out",
            RetryReason::EmptyResponse => "no response from license server",
            RetryReason::TransportFailed => "transport failure",
            RetryReason::Reprovisioned => "certificate was reprovisioned",
        };
        f.write_str(text)
    }
}

impl LicenseOrchestrator {
    pub fn new(
        server_url: impl Into<String>,
        pssh: Vec<u8>,
        mime_type: impl Into<String>,
        transactor: HttpTransactor,
        provisioner: ProvisioningClient,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            pssh,
            mime_type: mime_type.into(),
            transactor,
            provisioner,
            transaction_timeout: TRANSACTION_TIMEOUT,
            default_heartbeat_url: Mutex::new(None),
        }
    }

    /// Heartbeat URL captured from the engine's follow-up request, if the
    /// last acquisition got that far.
    pub fn default_heartbeat_url(&self) -> Option<String> {
        self.lock_heartbeat().clone()
    }

    /// Negotiate a key set for the session.
    ///
    /// Returns the key set the engine materialized from the server
    /// response. The key set is empty when the server denied the request;
    /// that outcome is not an error here, the caller decides what denied
    /// content means. The transaction worker is shut down on every exit
    /// path.
    pub fn acquire_key_set(
        &self,
        engine: &dyn DrmEngine,
        session_id: &[u8],
        key_type: KeyType,
    ) -> Result<Vec<u8>, LicenseError> {
        let worker = TransactWorker::spawn(self.transactor.clone(), self.server_url.clone())
            .map_err(|e| {
                error!("failed to start the license worker: {}", e);
                LicenseError::SubmissionFailed
            })?;
        let result = self.run(engine, session_id, key_type, &worker);
        worker.shutdown();
        result
    }

    fn run(
        &self,
        engine: &dyn DrmEngine,
        session_id: &[u8],
        key_type: KeyType,
        worker: &TransactWorker,
    ) -> Result<Vec<u8>, LicenseError> {
        let mut transaction_attempts: u32 = 0;
        let mut request_attempts: u32 = 0;
        let mut state = State::Idle;

        loop {
            state = match state {
                State::Idle => State::Requesting,

                State::Requesting => {
                    match engine.key_request(session_id, &self.pssh, &self.mime_type, key_type) {
                        Ok(request) => State::Transacting {
                            request: request.data,
                        },
                        Err(EngineError::NotProvisioned) => State::Provisioning,
                        Err(e) => {
                            error!("failed to build a license request: {}", e);
                            State::Failed(LicenseError::RequestFailed)
                        }
                    }
                }

                State::Provisioning => {
                    request_attempts += 1;
                    if request_attempts >= MAX_REQUEST_ATTEMPTS {
                        error!("no license request after {} attempts", MAX_REQUEST_ATTEMPTS);
                        State::Failed(LicenseError::RequestFailed)
                    } else {
                        info!("invalid certificate, reprovisioning");
                        if let Err(e) = self.provisioner.provision(engine) {
                            warn!("reprovisioning failed: {}", e);
                        }
                        State::Requesting
                    }
                }

                State::Transacting { request } => {
                    transaction_attempts += 1;
                    match self.transact(engine, session_id, key_type, worker, request) {
                        Outcome::Done(key_set_id) => State::Done { key_set_id },
                        Outcome::Fatal(err) => State::Failed(err),
                        Outcome::Retry(reason) => {
                            if transaction_attempts >= MAX_TRANSACTION_ATTEMPTS {
                                error!(
                                    "giving up after {} transaction attempts ({})",
                                    transaction_attempts, reason
                                );
                                State::Failed(reason.exhausted())
                            } else {
                                warn!(
                                    "license transaction attempt {} failed ({}), retrying",
                                    transaction_attempts, reason
                                );
                                request_attempts = 0;
                                State::Requesting
                            }
                        }
                    }
                }

                State::Done { key_set_id } => return Ok(key_set_id),
                State::Failed(err) => return Err(err),
            };
        }
    }

    /// One full transaction: submit, await, parse, feed back.
    fn transact(
        &self,
        engine: &dyn DrmEngine,
        session_id: &[u8],
        key_type: KeyType,
        worker: &TransactWorker,
        request: Vec<u8>,
    ) -> Outcome {
        let pending = match worker.submit(request) {
            Ok(pending) => pending,
            Err(SubmitError::Saturated) => {
                error!("license worker saturated, submission rejected");
                return Outcome::Retry(RetryReason::Rejected);
            }
            Err(SubmitError::Stopped) => {
                error!("license worker is gone");
                return Outcome::Fatal(LicenseError::SubmissionFailed);
            }
        };

        let body = match pending.wait(self.transaction_timeout) {
            WaitOutcome::Completed(Ok((_status, body))) => body,
            WaitOutcome::Completed(Err(e)) => {
                warn!("license transaction failed: {}", e);
                return Outcome::Retry(RetryReason::TransportFailed);
            }
            WaitOutcome::TimedOut => {
                debug!("license transaction timed out, cancelling");
                return Outcome::Retry(RetryReason::TimedOut);
            }
            WaitOutcome::WorkerGone => {
                error!("license worker dropped the transaction");
                return Outcome::Fatal(LicenseError::SubmissionFailed);
            }
        };

        if body.is_empty() {
            error!("no response from license server");
            return Outcome::Retry(RetryReason::EmptyResponse);
        }

        let payload = match unwrap_response(&body) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to parse license response: {}", e);
                return Outcome::Fatal(LicenseError::BadServerResponse(e));
            }
        };

        let key_set_id = match engine.provide_key_response(session_id, payload) {
            Ok(key_set_id) => {
                debug!("key set: {}", hex::encode(&key_set_id));
                key_set_id
            }
            Err(EngineError::NotProvisioned) => {
                info!("response invalidated the certificate, reprovisioning");
                if let Err(e) = self.provisioner.provision(engine) {
                    warn!("reprovisioning failed: {}", e);
                }
                return Outcome::Retry(RetryReason::Reprovisioned);
            }
            Err(EngineError::DeniedByServer) => {
                // Informational; the engine event channel drives recovery.
                info!("server rejected the key request");
                Vec::new()
            }
            Err(e) => {
                error!("provide_key_response failed: {}", e);
                Vec::new()
            }
        };

        self.capture_heartbeat_url(engine, session_id, key_type);

        Outcome::Done(key_set_id)
    }

    /// The first key request never carries the heartbeat URL; ask again and
    /// keep whatever comes back. Failures here are swallowed.
    fn capture_heartbeat_url(&self, engine: &dyn DrmEngine, session_id: &[u8], key_type: KeyType) {
        match engine.key_request(session_id, &self.pssh, &self.mime_type, key_type) {
            Ok(request) => {
                if let Some(url) = request.default_url {
                    debug!("default heartbeat url: {}", url);
                    *self.lock_heartbeat() = Some(url);
                }
            }
            Err(e) => warn!("failed to fetch the heartbeat url: {}", e),
        }
    }

    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        match self.default_heartbeat_url.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.transaction_timeout = timeout;
    }
}

/// Single-slot transaction worker.
///
/// One thread, one handoff slot: at most one license transaction is in
/// flight at a time, and at most one submission may wait in the slot.
/// Anything beyond that fails fast instead of queueing.
struct TransactWorker {
    slot: SyncSender<Job>,
    force_stop: Arc<AtomicBool>,
    terminated: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

struct Job {
    request: Vec<u8>,
    cancelled: Arc<AtomicBool>,
    reply: SyncSender<Result<(u16, Vec<u8>), TransportError>>,
}

#[derive(Debug)]
enum SubmitError {
    /// The slot already holds a pending transaction.
    Saturated,
    /// The worker thread is gone.
    Stopped,
}

/// A submitted transaction awaiting its reply.
struct PendingTransaction {
    cancelled: Arc<AtomicBool>,
    reply: Receiver<Result<(u16, Vec<u8>), TransportError>>,
}

enum WaitOutcome {
    Completed(Result<(u16, Vec<u8>), TransportError>),
    TimedOut,
    WorkerGone,
}

impl TransactWorker {
    fn spawn(transactor: HttpTransactor, url: String) -> std::io::Result<Self> {
        let (slot, jobs) = mpsc::sync_channel::<Job>(1);
        let (term_tx, terminated) = mpsc::sync_channel::<()>(1);
        let force_stop = Arc::new(AtomicBool::new(false));
        let thread_force = Arc::clone(&force_stop);

        let handle = thread::Builder::new()
            .name("license-transact".to_string())
            .spawn(move || {
                while let Ok(job) = jobs.recv() {
                    if thread_force.load(Ordering::Acquire) {
                        break;
                    }
                    if job.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    let result = transactor.post(&url, Some(&job.request), &[]);
                    if job.cancelled.load(Ordering::Acquire) {
                        // The caller timed out; discard the late result.
                        continue;
                    }
                    let _ = job.reply.try_send(result);
                }
                let _ = term_tx.try_send(());
            })?;

        Ok(Self {
            slot,
            force_stop,
            terminated,
            handle: Some(handle),
        })
    }

    fn submit(&self, request: Vec<u8>) -> Result<PendingTransaction, SubmitError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job = Job {
            request,
            cancelled: Arc::clone(&cancelled),
            reply: reply_tx,
        };
        match self.slot.try_send(job) {
            Ok(()) => Ok(PendingTransaction {
                cancelled,
                reply: reply_rx,
            }),
            Err(TrySendError::Full(_)) => Err(SubmitError::Saturated),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Stopped),
        }
    }

    /// Graceful-then-forced shutdown, one grace window per phase.
    fn shutdown(mut self) {
        drop(self.slot);
        let mut stopped = self.terminated.recv_timeout(SHUTDOWN_GRACE).is_ok();
        if !stopped {
            self.force_stop.store(true, Ordering::Release);
            stopped = self.terminated.recv_timeout(SHUTDOWN_GRACE).is_ok();
        }
        if let Some(handle) = self.handle.take() {
            if stopped {
                let _ = handle.join();
            } else {
                error!("license worker did not terminate within the grace period");
            }
        }
    }
}

impl PendingTransaction {
    /// Await the reply, bounded by `timeout` from submission.
    ///
    /// On timeout the transaction is cancelled cooperatively: a blocking
    /// POST cannot be interrupted mid-flight, so the worker discards its
    /// result instead.
    fn wait(self, timeout: Duration) -> WaitOutcome {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => WaitOutcome::Completed(result),
            Err(RecvTimeoutError::Timeout) => {
                self.cancelled.store(true, Ordering::Release);
                WaitOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => WaitOutcome::WorkerGone,
        }
    }
}
