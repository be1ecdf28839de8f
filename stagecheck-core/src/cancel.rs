//! Cooperative cancellation for validation runs.
//!
//! A [`CancelSignal`] fires either when [`CancelSignal::cancel`] is called or
//! when its optional deadline passes. The orchestrator races the in-flight
//! step against it; cleanup never waits on the signal.
//!
//! Signals derived with [`CancelSignal::deadline_from_now`] share the
//! explicit cancellation of their parent but carry their own deadline, so a
//! run deadline is counted from the start of each run.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<Option<String>>>,
    deadline: Option<Instant>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_deadline(after: Duration) -> Self {
        Self::build(Some(Instant::now() + after))
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            deadline,
        }
    }

    /// A signal that fires when this one is cancelled or `after` elapses from
    /// now, whichever comes first. An earlier deadline on `self` still holds.
    pub fn deadline_from_now(&self, after: Duration) -> Self {
        let fresh = Instant::now() + after;
        Self {
            tx: Arc::clone(&self.tx),
            deadline: Some(self.deadline.map_or(fresh, |d| d.min(fresh))),
        }
    }

    /// Requests cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        if let Some(reason) = self.tx.borrow().clone() {
            return Some(reason);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(deadline_reason()),
            _ => None,
        }
    }

    /// Resolves with the cancellation reason once the signal fires.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.tx.subscribe();
        let explicit = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(reason) = current {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                reason = explicit => reason,
                _ = tokio::time::sleep_until(deadline) => deadline_reason(),
            },
            None => explicit.await,
        }
    }
}

fn deadline_reason() -> String {
    "run deadline exceeded".to_string()
}
