//! Bounded pool of automation sessions.
//!
//! A lease holds both a semaphore permit and a live session. Dropping the
//! lease puts the session back on the idle stack before the permit is
//! released, so the pool never holds more than `size` sessions and a waiting
//! job always finds a warm session when one exists.

use crate::automation::{AutomationDriver, AutomationError, AutomationSession, Credentials, Step};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

type Idle = Arc<Mutex<Vec<Box<dyn AutomationSession>>>>;

#[derive(Clone)]
pub struct SessionPool {
    driver: Arc<dyn AutomationDriver>,
    idle: Idle,
    permits: Arc<Semaphore>,
    size: usize,
    step_timeout: Duration,
    created: Arc<AtomicUsize>,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn AutomationDriver>, size: usize, step_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            driver,
            idle: Arc::new(Mutex::new(Vec::with_capacity(size))),
            permits: Arc::new(Semaphore::new(size)),
            size,
            step_timeout,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Waits for a free slot, then hands out an idle session or opens a new one.
    pub async fn acquire(&self) -> Result<SessionLease, AutomationError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AutomationError::Network("session pool closed".into()))?;
        let reused = self.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            None => {
                let opened = timeout(self.step_timeout, self.driver.open_session())
                    .await
                    .map_err(|_| AutomationError::Timeout)??;
                let count = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(target = "fleet.sessions", created = count, "session opened");
                opened
            }
        };
        crate::metrics::session_checkout(self.size - self.permits.available_permits());
        Ok(SessionLease {
            session: Some(session),
            idle: self.idle.clone(),
            step_timeout: self.step_timeout,
            poisoned: false,
            in_flight: false,
            _permit: permit,
        })
    }
}

/// Scoped checkout of one session. Every call is bounded by the pool's step
/// timeout; errors that leave the page in an unknown state poison the lease.
pub struct SessionLease {
    session: Option<Box<dyn AutomationSession>>,
    idle: Idle,
    step_timeout: Duration,
    poisoned: bool,
    // Set while a call is awaiting; a lease dropped mid-call (job cancelled)
    // holds a session in an unknown state.
    in_flight: bool,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub async fn login(&mut self, credentials: &Credentials) -> Result<(), AutomationError> {
        let budget = self.step_timeout;
        self.in_flight = true;
        let session = self.session_mut()?;
        let result = match timeout(budget, session.login(credentials)).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::Timeout),
        };
        self.observe(result)
    }

    pub async fn interact(&mut self, steps: &[Step]) -> Result<Vec<String>, AutomationError> {
        let budget = step_budget(self.step_timeout, steps.len());
        self.in_flight = true;
        let session = self.session_mut()?;
        let result = match timeout(budget, session.interact(steps)).await {
            Ok(result) => result,
            Err(_) => Err(AutomationError::Timeout),
        };
        self.observe(result)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn AutomationSession>, AutomationError> {
        if self.poisoned {
            return Err(AutomationError::UnexpectedPage(
                "session discarded after earlier failure".into(),
            ));
        }
        self.session
            .as_mut()
            .ok_or_else(|| AutomationError::UnexpectedPage("session already released".into()))
    }

    fn observe<T>(&mut self, result: Result<T, AutomationError>) -> Result<T, AutomationError> {
        self.in_flight = false;
        if let Err(err) = &result
            && err.poisons_session()
        {
            self.poisoned = true;
        }
        result
    }
}

/// One step timeout per step; saturates instead of overflowing.
fn step_budget(step_timeout: Duration, steps: usize) -> Duration {
    u32::try_from(steps.max(1))
        .ok()
        .and_then(|count| step_timeout.checked_mul(count))
        .unwrap_or(Duration::MAX)
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if !self.poisoned && !self.in_flight {
            self.idle.lock().push(session);
            return;
        }
        warn!(target = "fleet.sessions", "discarding poisoned session");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }
}
