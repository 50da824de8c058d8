//! Retry policy applied at the storage boundary.
//!
//! Storage errors fall into three classes. Transient faults (busy/locked
//! database, lost connectivity) are retried with exponential backoff until
//! the attempt budget runs out. An expired authorization triggers exactly one
//! connection refresh followed by one retry of the same operation, without
//! consuming the transient budget. Everything else is returned untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::ErrorCode;
use tracing::{debug, warn};

use crate::error::{CatalogError, Result};

/// Caller-supplied cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail fast with `Cancelled` if the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CatalogError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    AuthExpired,
    Fatal,
}

/// Default classifier for SQLite-backed storage.
pub fn classify(err: &CatalogError) -> ErrorClass {
    match err {
        CatalogError::Storage(rusqlite::Error::SqliteFailure(e, _)) => match e.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure => ErrorClass::Transient,
            ErrorCode::AuthorizationForStatementDenied => ErrorClass::AuthExpired,
            _ => ErrorClass::Fatal,
        },
        _ => ErrorClass::Fatal,
    }
}

/// Exponential backoff: `base * 2^(retry - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed for transient faults (including the first).
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub classifier: fn(&CatalogError) -> ErrorClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff {
                base: Duration::from_millis(25),
                max: Duration::from_secs(1),
            },
            classifier: classify,
        }
    }
}

impl RetryPolicy {
    /// Run `op` against `state`, retrying according to the policy.
    ///
    /// `refresh` is invoked once when the classifier reports an expired
    /// authorization; it is expected to replace whatever connection or
    /// credential `state` holds.
    pub fn execute<S, T>(
        &self,
        cancel: &CancelToken,
        state: &mut S,
        mut op: impl FnMut(&mut S) -> Result<T>,
        mut refresh: impl FnMut(&mut S) -> Result<()>,
    ) -> Result<T> {
        let mut attempts = 0u32;
        let mut transient_failures = 0u32;
        let mut refreshed = false;

        loop {
            cancel.check()?;
            attempts += 1;

            let err = match op(state) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match (self.classifier)(&err) {
                ErrorClass::Fatal => return Err(err),
                ErrorClass::AuthExpired if !refreshed => {
                    warn!("Storage authorization expired, refreshing connection");
                    refreshed = true;
                    refresh(state)?;
                }
                ErrorClass::AuthExpired => {
                    warn!("Storage authorization still rejected after refresh");
                    return Err(exhausted(err, attempts));
                }
                ErrorClass::Transient => {
                    transient_failures += 1;
                    if transient_failures >= self.max_attempts {
                        warn!("Giving up after {} attempts: {}", attempts, err);
                        return Err(exhausted(err, attempts));
                    }
                    let delay = self.backoff.delay(transient_failures);
                    debug!("Transient storage fault ({}), retrying in {:?}", err, delay);
                    sleep_cancellable(cancel, delay)?;
                }
            }
        }
    }
}

fn exhausted(err: CatalogError, attempts: u32) -> CatalogError {
    match err {
        CatalogError::Storage(source) => CatalogError::Unavailable { attempts, source },
        other => other,
    }
}

fn sleep_cancellable(cancel: &CancelToken, delay: Duration) -> Result<()> {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + delay;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(SLICE));
    }
}
