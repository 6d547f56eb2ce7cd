//! Outstanding-work accounting for one connection.
//!
//! Every dispatched handler holds a [`WorkToken`] for as long as it runs.
//! Connection teardown closes the counter and waits for it to drain, so no
//! connection-scoped resource is released while a handler may still use it.

use std::{future::Future, sync::Arc};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};

/// Counter of handlers dispatched on a connection but not yet finished.
///
/// With a limit set, [`OutstandingWork::enter`] waits until fewer than
/// `max_in_flight` handlers are running. Without one it never waits.
#[derive(Clone, Debug)]
pub struct OutstandingWork {
    tracker: TaskTracker,
    admission: Option<Arc<Semaphore>>,
}

/// Proof of one unit of outstanding work; dropping it decrements the counter
#[derive(Debug)]
pub struct WorkToken {
    _token: TaskTrackerToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl OutstandingWork {
    pub fn new(max_in_flight: Option<usize>) -> OutstandingWork {
        OutstandingWork {
            tracker: TaskTracker::new(),
            admission: max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Increment the counter, waiting for admission first if limited
    pub async fn enter(&self) -> WorkToken {
        let permit = match self.admission {
            // never closed
            Some(ref admission) => Arc::clone(admission).acquire_owned().await.ok(),
            None => None,
        };

        WorkToken {
            _token: self.tracker.token(),
            _permit: permit,
        }
    }

    /// Run `fut` on the runtime, holding `token` until it completes
    pub fn spawn<F>(&self, token: WorkToken, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let output = fut.await;
            drop(token);
            output
        })
    }

    /// Number of units of work not yet finished
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Mark the connection as closing; `wait` may return from now on
    pub fn close(&self) {
        self.tracker.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Wait until the counter is closed and has drained to zero
    pub async fn wait(&self) {
        self.tracker.wait().await
    }
}
