//! Session lifecycle management.
//!
//! Opening a session can fail transiently (engine contention) or because the
//! device has no certificate yet. Both are handled here, inside a bounded
//! attempt budget; anything else is terminal.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::engine::{DrmEngine, SessionId};
use crate::error::{EngineError, SessionError};
use crate::provision::ProvisioningClient;

/// Engine-level open attempts before giving up.
const OPEN_ATTEMPTS: u32 = 3;

/// Backoff after a busy signal.
const BUSY_BACKOFF: Duration = Duration::from_millis(1000);

/// Opens and closes engine sessions with bounded retries.
pub struct SessionManager {
    provisioner: ProvisioningClient,
    last_session: Mutex<Option<SessionId>>,
}

impl SessionManager {
    pub fn new(provisioner: ProvisioningClient) -> Self {
        Self {
            provisioner,
            last_session: Mutex::new(None),
        }
    }

    /// Open a session, spending at most [`OPEN_ATTEMPTS`] engine calls.
    ///
    /// A busy engine earns a backoff before the next attempt; a missing
    /// certificate triggers one provisioning exchange and an immediate
    /// retry. Both count toward the budget. Exhaustion means no session
    /// exists and the caller must not assume otherwise.
    pub fn open(&self, engine: &dyn DrmEngine) -> Result<SessionId, SessionError> {
        for attempt in 1..=OPEN_ATTEMPTS {
            match engine.open_session() {
                Ok(session_id) => {
                    *self.lock_last() = Some(session_id.clone());
                    return Ok(session_id);
                }
                Err(EngineError::NotProvisioned) => {
                    info!(
                        "missing certificate, provisioning (attempt {}/{})",
                        attempt, OPEN_ATTEMPTS
                    );
                    if let Err(e) = self.provisioner.provision(engine) {
                        warn!("provisioning failed: {}", e);
                    }
                }
                Err(EngineError::ResourceBusy) => {
                    warn!(
                        "engine busy in open_session, retrying (attempt {}/{})",
                        attempt, OPEN_ATTEMPTS
                    );
                    thread::sleep(BUSY_BACKOFF);
                }
                Err(e) => return Err(SessionError::Engine(e)),
            }
        }
        error!("no session after {} attempts", OPEN_ATTEMPTS);
        Err(SessionError::ProvisioningFailed)
    }

    /// Close a session, best-effort.
    ///
    /// A handle that does not match the last opened session is a caller
    /// bug; it is logged and the close still goes through so the engine
    /// session is released either way.
    pub fn close(&self, engine: &dyn DrmEngine, session_id: &[u8]) {
        let matches_last = self.lock_last().as_deref() == Some(session_id);
        if !matches_last {
            error!("close: session id does not match the last opened session");
        }
        if let Err(e) = engine.close_session(session_id) {
            warn!("failed to close session: {}", e);
        }
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, Option<SessionId>> {
        match self.last_session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
