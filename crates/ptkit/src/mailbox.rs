//! Mailbox — the single task that owns a mirror's state.
//!
//! Every operation on a mirror (mutation, listener registration, bootstrap
//! replay, teardown) is posted here as a job and runs on one Tokio task, in
//! arrival order. Because the task is the only owner of the state there is no
//! data lock and no listener-registry lock: callbacks run after the job's
//! mutation is complete, and a callback that posts to the same mailbox is
//! queued behind the current job instead of re-entering it.
//!
//! A job that panics is caught and logged; the task keeps serving later jobs.
//! A caller awaiting that job gets [`PtkitError::JobPanicked`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{PtkitError, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub(crate) struct Mailbox<S> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> Mailbox<S> {
    /// Move `state` onto a freshly spawned task and return its mailbox.
    ///
    /// The task exits once every `Mailbox` clone has been dropped.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub(crate) fn spawn(name: Arc<str>, mut state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let task_name = Arc::clone(&name);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                    tracing::error!(mirror = %task_name, "mirror job panicked");
                }
            }
            tracing::debug!(mirror = %task_name, "mirror task stopped");
        });

        Self { name, tx }
    }

    /// Queue `job` without waiting for it to run.
    pub(crate) fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<()> {
        self.tx.send(Box::new(job)).map_err(|_| self.closed())
    }

    /// Queue `job` and resolve with its return value once it has run.
    pub(crate) async fn call<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let name = Arc::clone(&self.name);
        self.post(move |state| {
            let reply = catch_unwind(AssertUnwindSafe(|| job(state))).map_err(|_| {
                tracing::error!(mirror = %name, "mirror job panicked");
            });
            let _ = reply_tx.send(reply);
        })?;
        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(())) => Err(PtkitError::JobPanicked {
                mirror: self.name.to_string(),
            }),
            Err(_) => Err(self.closed()),
        }
    }

    fn closed(&self) -> PtkitError {
        PtkitError::Closed {
            mirror: self.name.to_string(),
        }
    }
}
