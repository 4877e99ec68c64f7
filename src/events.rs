//! Engine lifecycle worker.
//!
//! The engine's event channel and session lifecycle run on one dedicated
//! background thread, distinct from the threads issuing decrypt calls. The
//! worker constructs the engine, hands the caller a shared handle over a
//! one-shot readiness channel, then pumps the engine's event stream until
//! stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::engine::{DrmEngine, DrmEvent};
use crate::error::{EngineError, SessionError};

/// Bound on the wait for the engine handle to materialize.
pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long each event poll blocks; also bounds stop latency.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the background thread that constructs the engine and pumps its
/// event stream.
///
/// Events are logged and otherwise dropped: provisioning and key refresh
/// are driven synchronously by the pipeline, not by notifications.
pub struct EngineWorker<E: DrmEngine + 'static> {
    engine: Arc<E>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<E: DrmEngine + 'static> EngineWorker<E> {
    /// Start the worker and block until the engine signals readiness.
    ///
    /// The factory runs on the worker thread. If no readiness signal
    /// arrives within [`ENGINE_READY_TIMEOUT`] the start fails and the
    /// orphaned thread is told to wind down on its own; there is no usable
    /// engine in that case.
    pub fn start<F>(factory: F) -> Result<Self, SessionError>
    where
        F: FnOnce() -> Result<E, EngineError> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Arc<E>>(1);

        let handle = thread::Builder::new()
            .name("drm-engine".to_string())
            .spawn(move || {
                let engine = match factory() {
                    Ok(engine) => Arc::new(engine),
                    Err(e) => {
                        error!("engine construction failed: {}", e);
                        return;
                    }
                };
                // Readiness signal carries the handle. The receiver may
                // have given up already; wind down quietly if so.
                if ready_tx.send(Arc::clone(&engine)).is_err() {
                    return;
                }
                while !thread_stop.load(Ordering::Acquire) {
                    if let Some(event) = engine.poll_event(EVENT_POLL_INTERVAL) {
                        log_event(event);
                    }
                }
            })
            .map_err(|e| {
                SessionError::Engine(EngineError::Other(format!(
                    "failed to spawn engine worker: {}",
                    e
                )))
            })?;

        match ready_rx.recv_timeout(ENGINE_READY_TIMEOUT) {
            Ok(engine) => Ok(Self {
                engine,
                stop,
                handle: Some(handle),
            }),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "engine did not become ready within {:?}",
                    ENGINE_READY_TIMEOUT
                );
                stop.store(true, Ordering::Release);
                Err(SessionError::StartTimeout(ENGINE_READY_TIMEOUT))
            }
            Err(RecvTimeoutError::Disconnected) => {
                stop.store(true, Ordering::Release);
                let _ = handle.join();
                Err(SessionError::StartFailed)
            }
        }
    }

    /// Shared engine handle.
    pub fn engine(&self) -> Arc<E> {
        Arc::clone(&self.engine)
    }

    /// Stop the event loop and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("engine worker panicked");
            }
        }
    }
}

impl<E: DrmEngine + 'static> Drop for EngineWorker<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_event(event: DrmEvent) {
    match event {
        DrmEvent::ProvisioningRequired => info!("engine event: provisioning required"),
        DrmEvent::KeyRequired => info!("engine event: key required"),
        DrmEvent::KeyExpired => info!("engine event: key expired"),
        DrmEvent::VendorDefined(code) => info!("engine event: vendor defined ({})", code),
    }
}
